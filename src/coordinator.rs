//! The Coordinator: demultiplexes inbound frames onto the right server or
//! token, reacts to peer disconnects, and applies the handful of registry
//! events the database publishes.
//!
//! `CoordinatorShared` holds the in-process maps behind one
//! `parking_lot::Mutex` apiece; `Coordinator` is the thin owner that spawns
//! the long-lived tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::CoordinatorConfig;
use crate::connect::{self, ConnectContext, ConnectEvent};
use crate::database::{FleetEvent, SharedDatabase};
use crate::error::GcErrorCode;
use crate::invite_code;
use crate::newgrf::NewGrfTable;
use crate::probes::ConnectivityProbes;
use crate::protocol::{
    ConnectionType, GameType, IncomingFrame, ListedServer, OutgoingFrame,
};
use crate::registry::{LocalServer, ServerRegistry};
use crate::token::{self, FlowHandle, TokenTable};
use crate::verify::{self, VerifyContext, VerifyEvent};

/// session_id -> outbox, the Coordinator's side map between transport and
/// domain state.
#[derive(Default)]
struct SessionRegistry {
    outboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OutgoingFrame>>>,
}

impl SessionRegistry {
    fn insert(&self, session_id: String, outbox: mpsc::UnboundedSender<OutgoingFrame>) {
        self.outboxes.lock().insert(session_id, outbox);
    }

    fn remove(&self, session_id: &str) {
        self.outboxes.lock().remove(session_id);
    }

    fn send(&self, session_id: &str, frame: OutgoingFrame) {
        let outboxes = self.outboxes.lock();
        if let Some(outbox) = outboxes.get(session_id) {
            // A closed outbox means the peer is mid-disconnect; dropping the
            // frame is the transient-error policy .
            let _ = outbox.send(frame);
        }
    }
}

/// State shared by the Coordinator and every flow task it spawns.
pub struct CoordinatorShared {
    pub config: CoordinatorConfig,
    pub registry: ServerRegistry,
    pub tokens: TokenTable,
    pub newgrf: NewGrfTable,
    pub probes: Arc<dyn ConnectivityProbes>,
    pub database: SharedDatabase,
    sessions: SessionRegistry,
    /// server_id -> session_id owning it, so a disconnect can find what to
    /// clean up without walking the whole registry.
    session_by_server: Mutex<HashMap<String, String>>,
    /// server_id -> raw tokens of ConnectFlows currently targeting it, so
    /// removing a server can cancel them ("removing a server cancels
    /// any ConnectFlow referencing it") without walking the token table.
    connect_targets: Mutex<HashMap<String, Vec<String>>>,
    /// server_id -> raw token of the VerifyFlow currently classifying it, so
    /// a disconnect mid-classification can cancel it instead of letting it
    /// run the rest of the method ladder against a server that's gone.
    verify_targets: Mutex<HashMap<String, String>>,
}

impl CoordinatorShared {
    pub fn send(&self, session_id: &str, frame: OutgoingFrame) {
        self.sessions.send(session_id, frame);
    }

    fn register_connect_target(&self, server_id: &str, token: &str) {
        self.connect_targets.lock().entry(server_id.to_string()).or_default().push(token.to_string());
    }

    /// A flow calls this itself once it's done (success or exhaustion) so a
    /// later removal doesn't try to cancel an already-finished flow.
    pub(crate) fn unregister_connect_target(&self, server_id: &str, token: &str) {
        let mut targets = self.connect_targets.lock();
        if let Some(tokens) = targets.get_mut(server_id) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                targets.remove(server_id);
            }
        }
    }

    /// Abort every ConnectFlow still targeting `server_id`, as the registry
    /// entry itself is removed out from under them.
    fn cancel_connect_flows_for(&self, server_id: &str) {
        let tokens = self.connect_targets.lock().remove(server_id).unwrap_or_default();
        for token in tokens {
            self.tokens.drop_token(&token);
        }
    }

    fn register_verify_target(&self, server_id: &str, token: &str) {
        self.verify_targets.lock().insert(server_id.to_string(), token.to_string());
    }

    /// A verify flow calls this itself once it's decided a classification,
    /// so a later disconnect doesn't try to cancel an already-finished flow.
    pub(crate) fn unregister_verify_target(&self, server_id: &str, token: &str) {
        let mut targets = self.verify_targets.lock();
        if targets.get(server_id).map(String::as_str) == Some(token) {
            targets.remove(server_id);
        }
    }

    /// Abort the VerifyFlow still classifying `server_id`, if any, as the
    /// registry entry itself is removed out from under it.
    fn cancel_verify_flow_for(&self, server_id: &str) {
        if let Some(token) = self.verify_targets.lock().remove(server_id) {
            self.tokens.drop_token(&token);
        }
    }
}

pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        probes: Arc<dyn ConnectivityProbes>,
        database: SharedDatabase,
    ) -> Self {
        let shared = Arc::new(CoordinatorShared {
            config,
            registry: ServerRegistry::new(Arc::clone(&database)),
            tokens: TokenTable::new(),
            newgrf: NewGrfTable::new(),
            probes,
            database,
            sessions: SessionRegistry::default(),
            session_by_server: Mutex::new(HashMap::new()),
            connect_targets: Mutex::new(HashMap::new()),
            verify_targets: Mutex::new(HashMap::new()),
        });
        let coordinator = Self { shared: Arc::clone(&shared) };
        coordinator.run_fleet_listener();
        coordinator
    }

    pub fn shared(&self) -> Arc<CoordinatorShared> {
        Arc::clone(&self.shared)
    }

    pub fn listen_addr(&self) -> std::net::SocketAddr {
        self.shared.config.listen
    }

    /// Register a new peer session and return the receiving half of its
    /// outbox; the transport layer drains it onto the wire.
    pub fn accept_session(&self, session_id: String) -> mpsc::UnboundedReceiver<OutgoingFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.sessions.insert(session_id, tx);
        rx
    }

    /// Clean up everything a disconnected peer left behind: its outbox, its
    /// Local server entry (if it had one), and any flow token referencing
    /// it. Idempotent, regardless of call order.
    pub fn disconnect_session(&self, session_id: &str) {
        self.shared.sessions.remove(session_id);
        let server_id = self.shared.session_by_server.lock().remove(session_id);
        let Some(server_id) = server_id else { return };

        // A re-registration may have already handed `server_id` to a newer
        // session by the time this (older) session's disconnect runs; only
        // tear down the registry entry if it still belongs to us.
        let still_ours = self
            .shared
            .registry
            .with_server(&server_id, |s| s.local().is_some_and(|l| l.session_id == session_id))
            .unwrap_or(false);
        if !still_ours {
            return;
        }

        self.shared.registry.remove(&server_id);
        self.shared.cancel_connect_flows_for(&server_id);
        self.shared.cancel_verify_flow_for(&server_id);
        tokio::spawn({
            let database = Arc::clone(&self.shared.database);
            let server_id = server_id.clone();
            async move { database.publish_local_removed(&server_id).await }
        });
        tracing::info!(%server_id, %session_id, "peer disconnected, server removed");
    }

    /// Dispatch one inbound frame from `session_id`. This is the
    /// demultiplexing switchboard; each arm either answers immediately
    /// or spawns a flow task and returns.
    pub async fn dispatch(&self, session_id: &str, frame: IncomingFrame) {
        match frame {
            IncomingFrame::ServerRegister { protocol_version, game_type, server_port, invite_code, invite_code_secret } => {
                self.handle_server_register(
                    session_id,
                    protocol_version,
                    game_type,
                    server_port,
                    invite_code,
                    invite_code_secret,
                )
                .await;
            }
            IncomingFrame::ServerUpdate { newgrfs, info, .. } => {
                self.handle_server_update(session_id, newgrfs, info).await;
            }
            IncomingFrame::ClientListing { protocol_version, game_info_version, openttd_version, newgrf_lookup_table_cursor } => {
                self.handle_client_listing(
                    session_id,
                    protocol_version,
                    game_info_version,
                    &openttd_version,
                    newgrf_lookup_table_cursor,
                )
                .await;
            }
            IncomingFrame::ClientConnect { protocol_version, invite_code } => {
                self.handle_client_connect(session_id, protocol_version, invite_code).await;
            }
            IncomingFrame::ConnectFailed { token, tracking_number, .. } => {
                self.forward_connect_event(&token, |side| ConnectEvent::ConnectFailed { side, tracking_number });
            }
            IncomingFrame::ClientConnected { token, .. } => {
                self.forward_connect_event(&token, |side| ConnectEvent::ClientConnected { side });
            }
            IncomingFrame::StunResult { token, interface_number, result, .. } => {
                // Explicit no-op hook: the peer-echoed
                // SERCLI_STUN_RESULT frame is observed but does not drive
                // the ladder. Real STUN pairing arrives on the fleet event
                // bus from the probe/database boundary instead.
                tracing::debug!(%token, interface_number, result, "stun result observed, no action taken");
            }
        }
    }

    async fn handle_server_register(
        &self,
        session_id: &str,
        protocol_version: u8,
        game_type: GameType,
        server_port: u16,
        invite_code_in: Option<String>,
        invite_code_secret_in: Option<String>,
    ) {
        let shared = &self.shared;

        let reused = match (invite_code_in, invite_code_secret_in) {
            (Some(code), Some(secret))
                if invite_code::validate(shared.config.shared_secret.as_bytes(), &code, &secret) =>
            {
                Some(code)
            }
            _ => None,
        };

        let (server_id, fresh_secret) = match reused {
            Some(code) => (code, None),
            None => {
                let server_id = loop {
                    let ordinal = match shared.registry.next_ordinal().await {
                        Ok(ordinal) => ordinal,
                        Err(e) => {
                            tracing::error!("failed to allocate server ordinal: {e}");
                            shared.send(
                                session_id,
                                OutgoingFrame::Error {
                                    protocol_version,
                                    error: GcErrorCode::RegistrationFailed,
                                    detail: String::new(),
                                },
                            );
                            return;
                        }
                    };
                    match invite_code::generate(ordinal) {
                        Ok(code) if !shared.registry.contains(&code) => break code,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!("invite code generation failed: {e}");
                            continue;
                        }
                    }
                };
                let secret = invite_code::sign(shared.config.shared_secret.as_bytes(), &server_id);
                (server_id, Some(secret))
            }
        };

        let local = LocalServer {
            server_id: server_id.clone(),
            game_type,
            connection_type: ConnectionType::Unknown,
            info: None,
            newgrfs: Vec::new(),
            direct_ip: Default::default(),
            session_id: session_id.to_string(),
            server_port,
            invite_code_secret: fresh_secret.clone().unwrap_or_default(),
        };
        if let Err(e) = shared.registry.put_local(local) {
            shared.send(
                session_id,
                OutgoingFrame::Error {
                    protocol_version,
                    error: GcErrorCode::RegistrationFailed,
                    detail: e.to_string(),
                },
            );
            return;
        }
        shared.session_by_server.lock().insert(session_id.to_string(), server_id.clone());

        let token = shared.tokens.mint();
        shared.register_verify_target(&server_id, &token);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = VerifyContext {
            shared: Arc::clone(shared),
            session_id: session_id.to_string(),
            protocol_version,
            server_id: server_id.clone(),
            server_port,
            token: token.clone(),
            fresh_secret,
        };
        let task = tokio::spawn(verify::run(ctx, events_rx));
        shared.tokens.bind(token, FlowHandle::Verify { events: events_tx, task });
    }

    async fn handle_server_update(
        &self,
        session_id: &str,
        newgrfs: Vec<crate::protocol::NewGrfRef>,
        info: crate::protocol::ServerInfo,
    ) {
        let Some(server_id) = self.shared.session_by_server.lock().get(session_id).cloned() else {
            return;
        };
        self.shared.registry.with_server_mut(&server_id, |server| {
            server.update(info.clone());
            server.update_newgrf(newgrfs.clone());
        });

        let snapshot = self.shared.registry.with_server(&server_id, |server| {
            crate::database::LocalServerSnapshot {
                server_id: server_id.clone(),
                info: server.info().cloned(),
                newgrfs: newgrfs.clone(),
                direct_ip_v4: server.direct_ip().v4,
                direct_ip_v6: server.direct_ip().v6,
            }
        });
        if let Some(snapshot) = snapshot {
            self.shared.database.publish_local_registered(snapshot).await;
        }
    }

    async fn handle_client_listing(
        &self,
        session_id: &str,
        protocol_version: u8,
        game_info_version: u16,
        openttd_version: &str,
        newgrf_cursor: u32,
    ) {
        let shared = &self.shared;
        shared.database.stats_listing(game_info_version).await;

        // GC_NEWGRF_LOOKUP only exists from protocol version 4 onward; older
        // clients wouldn't know what to do with it.
        if protocol_version >= 4 {
            let delta = shared.newgrf.delta_since(newgrf_cursor);
            if !delta.is_empty() {
                shared.send(
                    session_id,
                    OutgoingFrame::NewGrfLookup { protocol_version, cursor: newgrf_cursor, table_delta: delta },
                );
            }
        }

        let mut reachable: Vec<ListedServer> = shared
            .registry
            .listing_snapshot()
            .into_iter()
            .filter(|entry| entry.connection_type != ConnectionType::Isolated)
            .filter_map(|entry| {
                entry.info.map(|info| ListedServer {
                    server_id: entry.server_id,
                    game_type: entry.game_type,
                    connection_type: entry.connection_type,
                    info,
                })
            })
            .collect();
        // Stable sort: version-matching servers first, registry order
        // preserved within each group.
        reachable.sort_by_key(|s| s.info.openttd_version != openttd_version);

        shared.send(
            session_id,
            OutgoingFrame::Listing { protocol_version, game_info_version, servers: reachable },
        );
    }

    async fn handle_client_connect(&self, session_id: &str, protocol_version: u8, invite_code: String) {
        let shared = &self.shared;
        if !shared.registry.contains(&invite_code) {
            shared.send(
                session_id,
                OutgoingFrame::Error { protocol_version, error: GcErrorCode::InvalidInviteCode, detail: invite_code },
            );
            self.disconnect_session(session_id);
            return;
        }

        let flow_token = shared.tokens.mint();
        shared.send(
            session_id,
            OutgoingFrame::Connecting {
                protocol_version,
                client_token: token::prefixed(&flow_token, crate::token::TokenSide::Client),
                invite_code: invite_code.clone(),
            },
        );

        shared.register_connect_target(&invite_code, &flow_token);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = ConnectContext {
            shared: Arc::clone(shared),
            client_session_id: session_id.to_string(),
            protocol_version,
            server_id: invite_code,
            token: flow_token.clone(),
        };
        let task = tokio::spawn(connect::run(ctx, events_rx));
        shared.tokens.bind(flow_token, FlowHandle::Connect { events: events_tx, task });
    }

    /// `CONNECT_FAILED`/`CLIENT_CONNECTED` both target a connect flow by
    /// prefixed token; build the matching event and forward it. Unknown
    /// tokens are dropped silently.
    fn forward_connect_event(&self, prefixed_token: &str, make: impl FnOnce(crate::token::TokenSide) -> ConnectEvent) {
        if let Some((side, sender)) = self.shared.tokens.resolve_connect(prefixed_token) {
            let _ = sender.send(make(side));
        }
    }

    /// Subscribe to the database's fleet event stream and apply it to the
    /// in-process registry, forwarding anything addressed to a Local
    /// server's session.
    fn run_fleet_listener(&self) {
        let shared = Arc::clone(&self.shared);
        let mut events = shared.database.sync_and_monitor();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply_fleet_event(&shared, event);
            }
        });
    }
}

fn apply_fleet_event(shared: &CoordinatorShared, event: FleetEvent) {
    match event {
        FleetEvent::ExternalServerUpdated { server_id, info } => {
            if ensure_external(shared, &server_id) {
                shared.registry.with_server_mut(&server_id, |s| s.update(info));
            }
        }
        FleetEvent::ExternalNewGrfUpdated { server_id, newgrfs } => {
            if ensure_external(shared, &server_id) {
                shared.registry.with_server_mut(&server_id, |s| s.update_newgrf(newgrfs));
            }
        }
        FleetEvent::ExternalDirectIpUpdated { server_id, addr } => {
            if ensure_external(shared, &server_id) {
                shared.registry.with_server_mut(&server_id, |s| s.update_direct_ip(addr));
            }
        }
        FleetEvent::ExternalServerRemoved { server_id } => {
            shared.registry.remove(&server_id);
            shared.cancel_connect_flows_for(&server_id);
        }
        FleetEvent::ServerStunRequest { server_id, protocol_version, token } => {
            deliver_to_local(shared, &server_id, OutgoingFrame::StunRequest { protocol_version, token });
        }
        FleetEvent::ServerStunConnect { server_id, protocol_version, token, tracking_number, interface_number, peer_addr } => {
            deliver_to_local(
                shared,
                &server_id,
                OutgoingFrame::StunConnect { protocol_version, token, tracking_number, interface_number, peer_addr },
            );
        }
        FleetEvent::ServerConnectDirect { server_id, protocol_version, token, tracking_number, addr } => {
            deliver_to_local(shared, &server_id, OutgoingFrame::ConnectDirect { protocol_version, token, tracking_number, addr });
        }
        FleetEvent::ServerTurnConnect { server_id, protocol_version, token, tracking_number, relay_addr, relay_token } => {
            deliver_to_local(
                shared,
                &server_id,
                OutgoingFrame::TurnConnect { protocol_version, token, tracking_number, relay_addr, relay_token },
            );
        }
        FleetEvent::ServerConnectFailed { server_id, protocol_version, token } => {
            deliver_to_local(
                shared,
                &server_id,
                OutgoingFrame::Error { protocol_version, error: GcErrorCode::NoConnection, detail: token },
            );
        }
        FleetEvent::StunResult { token, interface_number, peer_addr } => {
            // A STUN result can target either flow kind; resolution by
            // prefixed token already disambiguates which table holds it.
            if let Some(sender) = shared.tokens.resolve_verify(&token) {
                let _ = sender.send(VerifyEvent::StunResult { interface_number, result: true });
            } else if let Some((side, sender)) = shared.tokens.resolve_connect(&token) {
                let _ = sender.send(ConnectEvent::StunResult { side, interface_number, peer_addr });
            }
        }
        FleetEvent::NewGrfAdded { index, entry } => shared.newgrf.add(index, entry),
        FleetEvent::NewGrfRemoved { grfid, md5sum } => shared.newgrf.drop_matching(grfid, &md5sum),
    }
}

/// `put_external` creates on miss, refuses (logging) if we own it locally.
/// Returns whether the caller should proceed to apply the field update.
fn ensure_external(shared: &CoordinatorShared, server_id: &str) -> bool {
    match shared.registry.put_external(server_id) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("{e}");
            false
        }
    }
}

fn deliver_to_local(shared: &CoordinatorShared, server_id: &str, frame: OutgoingFrame) {
    let session_id = shared.registry.with_server(server_id, |s| s.local().map(|l| l.session_id.clone())).flatten();
    match session_id {
        Some(session_id) => shared.send(&session_id, frame),
        None => tracing::error!(
            server_id,
            "internal error: fleet instruction addressed to a server this instance does not own locally"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::LocalDatabase;
    use crate::probes::NullProbes;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            shared_secret: "test-shared-secret".to_string(),
            socks_proxy: None,
            listen: "127.0.0.1:3976".parse().unwrap(),
            method_timeout: std::time::Duration::from_millis(200),
            log_json: false,
        }
    }

    #[tokio::test]
    async fn invalid_invite_code_errors_and_closes_session() {
        let coordinator = Coordinator::new(test_config(), Arc::new(NullProbes), Arc::new(LocalDatabase::new()));
        let mut rx = coordinator.accept_session("client-1".to_string());

        coordinator
            .dispatch(
                "client-1",
                IncomingFrame::ClientConnect { protocol_version: 4, invite_code: "+deadbee".to_string() },
            )
            .await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, OutgoingFrame::Error { error: GcErrorCode::InvalidInviteCode, .. }));
        assert!(coordinator.shared.tokens.is_empty());
    }

    #[tokio::test]
    async fn fresh_registration_allocates_ordinal_one_and_classifies_isolated_without_probes() {
        let coordinator = Coordinator::new(test_config(), Arc::new(NullProbes), Arc::new(LocalDatabase::new()));
        let mut rx = coordinator.accept_session("server-1".to_string());

        coordinator
            .dispatch(
                "server-1",
                IncomingFrame::ServerRegister {
                    protocol_version: 4,
                    game_type: GameType::Public,
                    server_port: 3979,
                    invite_code: None,
                    invite_code_secret: None,
                },
            )
            .await;

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            OutgoingFrame::RegisterAck { connection_type, invite_code, invite_code_secret, .. } => {
                assert_eq!(invite_code, "+0000001");
                assert!(invite_code_secret.is_some());
                assert_eq!(connection_type, ConnectionType::Isolated);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
