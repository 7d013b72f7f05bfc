//! Verify flow: classifies a freshly registered server as `DIRECT`,
//! `STUN`, `TURN`, or `ISOLATED` by attempting each method in order and
//! stopping at the first success.
//!
//! Implemented as a `tokio::task` per the "coroutine flows" design note:
//! the task owns its state machine and is cancelled by aborting its
//! `JoinHandle` (stored in the [`TokenTable`](crate::token::TokenTable)),
//! rather than by a shared enum advanced from outside.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::coordinator::CoordinatorShared;
use crate::protocol::{ConnectionType, OutgoingFrame};
use crate::token::TokenSide;

/// Events that can reach a running verify flow. Currently only STUN
/// results — `SERCLI_STUN_RESULT` is the only frame a peer can send that
/// targets a verify token mid-flight.
#[derive(Debug, Clone)]
pub enum VerifyEvent {
    StunResult { interface_number: u8, result: bool },
}

pub struct VerifyContext {
    pub shared: Arc<CoordinatorShared>,
    pub session_id: String,
    pub protocol_version: u8,
    pub server_id: String,
    pub server_port: u16,
    pub token: String,
    pub fresh_secret: Option<String>,
}

/// Drive one server through the classification ladder. Returns once a
/// classification has been decided and reported, having already dropped
/// its own token.
pub async fn run(ctx: VerifyContext, mut events: mpsc::UnboundedReceiver<VerifyEvent>) {
    let connection_type = classify(&ctx, &mut events).await;

    ctx.shared
        .registry
        .with_server_mut(&ctx.server_id, |server| server.set_connection_type(connection_type));

    ctx.shared.send(
        &ctx.session_id,
        OutgoingFrame::RegisterAck {
            protocol_version: ctx.protocol_version,
            connection_type,
            invite_code: ctx.server_id.clone(),
            invite_code_secret: ctx.fresh_secret.clone(),
        },
    );

    tracing::info!(
        server_id = %ctx.server_id,
        connection_type = ?connection_type,
        "verify flow decided classification"
    );

    ctx.shared.unregister_verify_target(&ctx.server_id, &ctx.token);
    ctx.shared.tokens.drop_token(&ctx.token);
}

async fn classify(ctx: &VerifyContext, events: &mut mpsc::UnboundedReceiver<VerifyEvent>) -> ConnectionType {
    if let Some(addr) = ctx.shared.probes.probe_direct(&ctx.server_id, ctx.server_port).await {
        ctx.shared
            .registry
            .with_server_mut(&ctx.server_id, |server| server.update_direct_ip(addr));
        return ConnectionType::Direct;
    }

    let verify_token = crate::token::prefixed(&ctx.token, TokenSide::Server);
    ctx.shared.probes.request_stun(&ctx.server_id, &verify_token).await;
    if wait_for_stun_success(events, ctx.shared.config.method_timeout).await {
        return ConnectionType::Stun;
    }

    if ctx.shared.probes.allocate_relay(&ctx.server_id).await.is_some() {
        return ConnectionType::Turn;
    }

    ConnectionType::Isolated
}

async fn wait_for_stun_success(
    events: &mut mpsc::UnboundedReceiver<VerifyEvent>,
    timeout: Duration,
) -> bool {
    let wait = async {
        while let Some(event) = events.recv().await {
            let VerifyEvent::StunResult { result, .. } = event;
            if result {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}
