//! Connect flow: walks a client and a target server through the
//! method ladder (`DIRECT_IPV6` → `DIRECT_IPV4` → `STUN` → `TURN`) until
//! one succeeds or all are exhausted.
//!
//! For a Local server the coordinator talks to the peer directly; for an
//! External server, instructions are forwarded through the
//! [`Database`](crate::database::Database) as cross-instance RPC. Both
//! paths converge on the same [`OutgoingFrame`] shapes from the client's
//! point of view.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::coordinator::CoordinatorShared;
use crate::database::ExternalInstruction;
use crate::error::GcErrorCode;
use crate::protocol::{ConnectMethod, ConnectionType, OutgoingFrame};
use crate::token::TokenSide;

#[derive(Debug, Clone)]
pub enum ConnectEvent {
    ConnectFailed { side: TokenSide, tracking_number: u8 },
    ClientConnected { side: TokenSide },
    StunResult { side: TokenSide, interface_number: u8, peer_addr: SocketAddr },
}

pub struct ConnectContext {
    pub shared: Arc<CoordinatorShared>,
    pub client_session_id: String,
    pub protocol_version: u8,
    pub server_id: String,
    pub token: String,
}

/// Outcome of evaluating a single method: either the ladder should advance,
/// or the flow as a whole is done (success or exhaustion).
enum StepOutcome {
    Advance,
    Connected,
}

pub async fn run(ctx: ConnectContext, mut events: mpsc::UnboundedReceiver<ConnectEvent>) {
    let eligible = eligible_methods(&ctx);

    for method in eligible {
        match run_method(&ctx, method, &mut events).await {
            StepOutcome::Connected => {
                tracing::info!(server_id = %ctx.server_id, ?method, "connect flow succeeded");
                ctx.shared.unregister_connect_target(&ctx.server_id, &ctx.token);
                ctx.shared.tokens.drop_token(&ctx.token);
                return;
            }
            StepOutcome::Advance => continue,
        }
    }

    tracing::info!(server_id = %ctx.server_id, "connect flow exhausted the method ladder");
    ctx.shared.send(
        &ctx.client_session_id,
        OutgoingFrame::Error {
            protocol_version: ctx.protocol_version,
            error: GcErrorCode::NoConnection,
            detail: ctx.server_id.clone(),
        },
    );
    ctx.shared.unregister_connect_target(&ctx.server_id, &ctx.token);
    ctx.shared.tokens.drop_token(&ctx.token);
}

/// The prefix of the ladder consistent with the target's classification
/// and known direct endpoints.
fn eligible_methods(ctx: &ConnectContext) -> Vec<ConnectMethod> {
    let Some((direct_ip, connection_type)) = ctx
        .shared
        .registry
        .with_server(&ctx.server_id, |s| (s.direct_ip().clone(), s.connection_type()))
    else {
        return Vec::new();
    };

    ConnectMethod::LADDER
        .into_iter()
        .filter(|method| match method {
            ConnectMethod::DirectIpv6 => direct_ip.v6.is_some(),
            ConnectMethod::DirectIpv4 => direct_ip.v4.is_some(),
            ConnectMethod::Stun => {
                matches!(connection_type, ConnectionType::Stun | ConnectionType::Unknown)
            }
            ConnectMethod::Turn => connection_type == ConnectionType::Turn,
        })
        .collect()
}

async fn run_method(
    ctx: &ConnectContext,
    method: ConnectMethod,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> StepOutcome {
    match method {
        ConnectMethod::DirectIpv6 | ConnectMethod::DirectIpv4 => run_direct(ctx, method, events).await,
        ConnectMethod::Stun => run_stun(ctx, method, events).await,
        ConnectMethod::Turn => run_turn(ctx, method, events).await,
    }
}

async fn run_direct(
    ctx: &ConnectContext,
    method: ConnectMethod,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> StepOutcome {
    let Some(addr) = ctx
        .shared
        .registry
        .with_server(&ctx.server_id, |s| {
            match method {
                ConnectMethod::DirectIpv6 => s.direct_ip().v6,
                _ => s.direct_ip().v4,
            }
        })
        .flatten()
    else {
        return StepOutcome::Advance;
    };

    ctx.shared.send(
        &ctx.client_session_id,
        OutgoingFrame::ConnectDirect {
            protocol_version: ctx.protocol_version,
            token: crate::token::prefixed(&ctx.token, TokenSide::Client),
            tracking_number: method.tracking_number(),
            addr,
        },
    );

    wait_for_outcome(ctx, method, events).await
}

async fn run_stun(
    ctx: &ConnectContext,
    method: ConnectMethod,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> StepOutcome {
    request_stun_from(ctx, TokenSide::Client).await;
    request_stun_from(ctx, TokenSide::Server).await;

    let Some((interface_number, client_addr, server_addr)) = collect_stun_pair(ctx, events).await else {
        return StepOutcome::Advance;
    };

    ctx.shared.send(
        &ctx.client_session_id,
        OutgoingFrame::StunConnect {
            protocol_version: ctx.protocol_version,
            token: crate::token::prefixed(&ctx.token, TokenSide::Client),
            tracking_number: method.tracking_number(),
            interface_number,
            peer_addr: server_addr,
        },
    );
    send_to_server(
        ctx,
        OutgoingFrame::StunConnect {
            protocol_version: ctx.protocol_version,
            token: crate::token::prefixed(&ctx.token, TokenSide::Server),
            tracking_number: method.tracking_number(),
            interface_number,
            peer_addr: client_addr,
        },
    )
    .await;

    wait_for_outcome(ctx, method, events).await
}

async fn request_stun_from(ctx: &ConnectContext, side: TokenSide) {
    let token = crate::token::prefixed(&ctx.token, side);
    match side {
        TokenSide::Client => {
            ctx.shared.send(
                &ctx.client_session_id,
                OutgoingFrame::StunRequest { protocol_version: ctx.protocol_version, token },
            );
        }
        TokenSide::Server => {
            send_to_server(ctx, OutgoingFrame::StunRequest { protocol_version: ctx.protocol_version, token }).await;
        }
    }
}

/// Wait (bounded by the per-method timeout) for a STUN result from both
/// sides that share an `interface_number`, matching a multi-homed peer's
/// result to the right interface on the other side rather than pairing
/// whichever two results arrive first. Returns `None` on timeout or if no
/// interface is reported by both sides.
async fn collect_stun_pair(
    ctx: &ConnectContext,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> Option<(u8, SocketAddr, SocketAddr)> {
    use std::collections::HashMap;

    let mut client_addrs: HashMap<u8, SocketAddr> = HashMap::new();
    let mut server_addrs: HashMap<u8, SocketAddr> = HashMap::new();

    let wait = async {
        loop {
            match events.recv().await? {
                ConnectEvent::StunResult { side: TokenSide::Client, interface_number, peer_addr } => {
                    client_addrs.insert(interface_number, peer_addr);
                }
                ConnectEvent::StunResult { side: TokenSide::Server, interface_number, peer_addr } => {
                    server_addrs.insert(interface_number, peer_addr);
                }
                _ => {}
            }
            if let Some(&interface_number) = client_addrs.keys().find(|k| server_addrs.contains_key(k)) {
                return Some(interface_number);
            }
        }
    };

    let interface_number = tokio::time::timeout(ctx.shared.config.method_timeout, wait).await.ok().flatten()?;
    Some((interface_number, client_addrs[&interface_number], server_addrs[&interface_number]))
}

async fn run_turn(
    ctx: &ConnectContext,
    method: ConnectMethod,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> StepOutcome {
    let Some(relay) = ctx.shared.probes.allocate_relay(&ctx.server_id).await else {
        return StepOutcome::Advance;
    };

    ctx.shared.send(
        &ctx.client_session_id,
        OutgoingFrame::TurnConnect {
            protocol_version: ctx.protocol_version,
            token: crate::token::prefixed(&ctx.token, TokenSide::Client),
            tracking_number: method.tracking_number(),
            relay_addr: relay.addr,
            relay_token: relay.session_token.clone(),
        },
    );
    send_to_server(
        ctx,
        OutgoingFrame::TurnConnect {
            protocol_version: ctx.protocol_version,
            token: crate::token::prefixed(&ctx.token, TokenSide::Server),
            tracking_number: method.tracking_number(),
            relay_addr: relay.addr,
            relay_token: relay.session_token,
        },
    )
    .await;

    wait_for_outcome(ctx, method, events).await
}

/// For a Local server, deliver directly to its session. For External,
/// forward through the database as cross-instance RPC.
async fn send_to_server(ctx: &ConnectContext, frame: OutgoingFrame) {
    let local_session = ctx.shared.registry.with_server(&ctx.server_id, |s| {
        s.local().map(|l| l.session_id.clone())
    }).flatten();

    if let Some(session_id) = local_session {
        ctx.shared.send(&session_id, frame);
        return;
    }

    let instruction = match frame {
        OutgoingFrame::StunRequest { protocol_version, token } => {
            ExternalInstruction::StunRequest { protocol_version, token }
        }
        OutgoingFrame::StunConnect { protocol_version, token, tracking_number, interface_number, peer_addr } => {
            ExternalInstruction::StunConnect {
                protocol_version,
                token,
                tracking_number,
                interface_number,
                peer_addr,
            }
        }
        OutgoingFrame::ConnectDirect { protocol_version, token, tracking_number, addr } => {
            ExternalInstruction::ConnectDirect { protocol_version, token, tracking_number, addr }
        }
        OutgoingFrame::TurnConnect { protocol_version, token, tracking_number, relay_addr, relay_token } => {
            ExternalInstruction::TurnConnect { protocol_version, token, tracking_number, relay_addr, relay_token }
        }
        _ => return,
    };
    ctx.shared.database.forward_to_external(&ctx.server_id, instruction).await;
}

/// Race "this method succeeded" against "this method failed" against a
/// timeout, ignoring any `ConnectFailed` whose tracking number doesn't
/// match the method currently in flight (stale failures
/// are a race, not a signal).
async fn wait_for_outcome(
    ctx: &ConnectContext,
    method: ConnectMethod,
    events: &mut mpsc::UnboundedReceiver<ConnectEvent>,
) -> StepOutcome {
    let wait = async {
        loop {
            match events.recv().await {
                Some(ConnectEvent::ClientConnected { .. }) => return StepOutcome::Connected,
                Some(ConnectEvent::ConnectFailed { tracking_number, .. })
                    if tracking_number == method.tracking_number() =>
                {
                    return StepOutcome::Advance
                }
                Some(_) => continue,
                None => return StepOutcome::Advance,
            }
        }
    };

    tokio::time::timeout(ctx.shared.config.method_timeout, wait)
        .await
        .unwrap_or(StepOutcome::Advance)
}
