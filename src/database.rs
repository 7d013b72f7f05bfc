//! The `Database` boundary: an external collaborator, modeled purely
//! as a trait plus the message shapes crossing it. The real persistent,
//! shared database — used only for ordinal allocation, cross-instance
//! event fan-out, and stats — is out of scope; what lives here is the
//! contract the core depends on, plus two implementations:
//!
//! - [`SqliteDatabase`]: persists the monotonic ordinal counter (so
//!   invite codes survive a restart) and logs stats via `rusqlite`.
//! - [`LocalDatabase`]: a pure in-memory fake for tests and for
//!   single-instance deployments, built around the same cross-instance
//!   message-bus shape minus any real transport.
//!
//! Both share a `FleetBus`: a `tokio::sync::broadcast` channel carrying the
//! database→core callback shapes, so wiring two `Coordinator`s to clones of
//! the same bus exercises the Local/External registry split end to end —
//! the only way to trigger it without a real second process.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::error::DatabaseError;
use crate::protocol::{NewGrfEntry, NewGrfRef, ServerInfo};

/// A server's publishable state, sent to the database when it transitions
/// to Local (or is updated) so sibling instances can mirror it as External.
#[derive(Debug, Clone)]
pub struct LocalServerSnapshot {
    pub server_id: String,
    pub info: Option<ServerInfo>,
    pub newgrfs: Vec<NewGrfRef>,
    pub direct_ip_v4: Option<SocketAddr>,
    pub direct_ip_v6: Option<SocketAddr>,
}

/// An instruction a ConnectFlow needs delivered to an External server's
/// owning instance, forwarded through the database as cross-instance RPC.
#[derive(Debug, Clone)]
pub enum ExternalInstruction {
    StunRequest {
        protocol_version: u8,
        token: String,
    },
    StunConnect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        interface_number: u8,
        peer_addr: SocketAddr,
    },
    ConnectDirect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        addr: SocketAddr,
    },
    TurnConnect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        relay_addr: SocketAddr,
        relay_token: String,
    },
    ConnectFailed {
        protocol_version: u8,
        token: String,
    },
}

/// Database→core callbacks, fanned out on the shared bus.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    ExternalServerUpdated { server_id: String, info: ServerInfo },
    ExternalNewGrfUpdated { server_id: String, newgrfs: Vec<NewGrfRef> },
    ExternalDirectIpUpdated { server_id: String, addr: SocketAddr },
    ExternalServerRemoved { server_id: String },
    ServerStunRequest { server_id: String, protocol_version: u8, token: String },
    ServerStunConnect {
        server_id: String,
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        interface_number: u8,
        peer_addr: SocketAddr,
    },
    ServerConnectDirect {
        server_id: String,
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        addr: SocketAddr,
    },
    ServerTurnConnect {
        server_id: String,
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        relay_addr: SocketAddr,
        relay_token: String,
    },
    ServerConnectFailed { server_id: String, protocol_version: u8, token: String },
    StunResult { token: String, interface_number: u8, peer_addr: SocketAddr },
    NewGrfAdded { index: u32, entry: NewGrfEntry },
    NewGrfRemoved { grfid: u32, md5sum: String },
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Monotonic ordinal used only when no valid invite code was presented.
    async fn get_server_id(&self) -> Result<u64, DatabaseError>;

    /// Fire-and-forget metric; failures are logged, never propagated.
    async fn stats_listing(&self, game_info_version: u16);

    /// Subscribe to the fleet event stream. Called once at startup.
    fn sync_and_monitor(&self) -> mpsc::UnboundedReceiver<FleetEvent>;

    /// Publish a Local server's state so sibling instances can mirror it.
    async fn publish_local_registered(&self, snapshot: LocalServerSnapshot);

    async fn publish_local_removed(&self, server_id: &str);

    /// Forward a connect-ladder instruction to an External server's owner.
    async fn forward_to_external(&self, server_id: &str, instruction: ExternalInstruction);
}

/// Shared fan-out primitive backing both [`Database`] implementations.
/// Cloning a `FleetBus` and handing the clone to a second `Coordinator`
/// simulates a sibling coordinator instance sharing the same database.
#[derive(Clone)]
pub struct FleetBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl FleetBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    /// Inject a fleet event, as whatever component fronts the real shared
    /// database (a STUN-server ingestion handler, an admin tool) would.
    pub fn publish(&self, event: FleetEvent) {
        // No subscribers is the common case for a lone instance; that is
        // not an error.
        let _ = self.tx.send(event);
    }

    fn subscribe_into_mpsc(&self) -> mpsc::UnboundedReceiver<FleetEvent> {
        let mut rx = self.tx.subscribe();
        let (tx, forwarded) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("fleet event bus lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        forwarded
    }
}

impl Default for FleetBus {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_to_event(snapshot: LocalServerSnapshot) -> Vec<FleetEvent> {
    let mut events = Vec::new();
    if let Some(info) = snapshot.info {
        events.push(FleetEvent::ExternalServerUpdated { server_id: snapshot.server_id.clone(), info });
    }
    if !snapshot.newgrfs.is_empty() {
        events.push(FleetEvent::ExternalNewGrfUpdated {
            server_id: snapshot.server_id.clone(),
            newgrfs: snapshot.newgrfs,
        });
    }
    for addr in snapshot.direct_ip_v4.into_iter().chain(snapshot.direct_ip_v6) {
        events.push(FleetEvent::ExternalDirectIpUpdated { server_id: snapshot.server_id.clone(), addr });
    }
    events
}

fn instruction_to_event(server_id: &str, instruction: ExternalInstruction) -> FleetEvent {
    match instruction {
        ExternalInstruction::StunRequest { protocol_version, token } => {
            FleetEvent::ServerStunRequest { server_id: server_id.to_string(), protocol_version, token }
        }
        ExternalInstruction::StunConnect { protocol_version, token, tracking_number, interface_number, peer_addr } => {
            FleetEvent::ServerStunConnect {
                server_id: server_id.to_string(),
                protocol_version,
                token,
                tracking_number,
                interface_number,
                peer_addr,
            }
        }
        ExternalInstruction::ConnectDirect { protocol_version, token, tracking_number, addr } => {
            FleetEvent::ServerConnectDirect {
                server_id: server_id.to_string(),
                protocol_version,
                token,
                tracking_number,
                addr,
            }
        }
        ExternalInstruction::TurnConnect { protocol_version, token, tracking_number, relay_addr, relay_token } => {
            FleetEvent::ServerTurnConnect {
                server_id: server_id.to_string(),
                protocol_version,
                token,
                tracking_number,
                relay_addr,
                relay_token,
            }
        }
        ExternalInstruction::ConnectFailed { protocol_version, token } => {
            FleetEvent::ServerConnectFailed { server_id: server_id.to_string(), protocol_version, token }
        }
    }
}

/// Pure in-memory fake: no persistence, ordinal counter resets on restart.
/// Used by tests and by deployments that don't need cross-restart invite
/// code stability.
pub struct LocalDatabase {
    bus: FleetBus,
    next_ordinal: Mutex<u64>,
}

impl LocalDatabase {
    pub fn new() -> Self {
        Self::with_bus(FleetBus::new())
    }

    pub fn with_bus(bus: FleetBus) -> Self {
        Self { bus, next_ordinal: Mutex::new(1) }
    }

    pub fn bus(&self) -> FleetBus {
        self.bus.clone()
    }
}

impl Default for LocalDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for LocalDatabase {
    async fn get_server_id(&self) -> Result<u64, DatabaseError> {
        let mut next = self.next_ordinal.lock();
        let ordinal = *next;
        *next += 1;
        Ok(ordinal)
    }

    async fn stats_listing(&self, game_info_version: u16) {
        tracing::debug!(game_info_version, "stats_listing (in-memory, not persisted)");
    }

    fn sync_and_monitor(&self) -> mpsc::UnboundedReceiver<FleetEvent> {
        self.bus.subscribe_into_mpsc()
    }

    async fn publish_local_registered(&self, snapshot: LocalServerSnapshot) {
        for event in snapshot_to_event(snapshot) {
            self.bus.publish(event);
        }
    }

    async fn publish_local_removed(&self, server_id: &str) {
        self.bus.publish(FleetEvent::ExternalServerRemoved { server_id: server_id.to_string() });
    }

    async fn forward_to_external(&self, server_id: &str, instruction: ExternalInstruction) {
        self.bus.publish(instruction_to_event(server_id, instruction));
    }
}

/// Sqlite-backed ordinal counter and stats log, kept behind a small
/// struct wrapping a `Mutex<Connection>`.
pub struct SqliteDatabase {
    conn: Mutex<rusqlite::Connection>,
    bus: FleetBus,
}

impl SqliteDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        Self::open_with_bus(path, FleetBus::new())
    }

    pub fn open_with_bus<P: AsRef<Path>>(path: P, bus: FleetBus) -> Result<Self, DatabaseError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS ordinal_counter (id INTEGER PRIMARY KEY CHECK (id = 0), next INTEGER NOT NULL);
             INSERT OR IGNORE INTO ordinal_counter (id, next) VALUES (0, 1);
             CREATE TABLE IF NOT EXISTS listing_stats (game_info_version INTEGER NOT NULL, requested_at TEXT NOT NULL);",
        )?;
        Ok(Self { conn: Mutex::new(conn), bus })
    }

    pub fn bus(&self) -> FleetBus {
        self.bus.clone()
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn get_server_id(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock();
        let ordinal: u64 = conn.query_row(
            "UPDATE ordinal_counter SET next = next + 1 WHERE id = 0 RETURNING next - 1",
            [],
            |row| row.get(0),
        )?;
        Ok(ordinal)
    }

    async fn stats_listing(&self, game_info_version: u16) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT INTO listing_stats (game_info_version, requested_at) VALUES (?1, datetime('now'))",
            rusqlite::params![game_info_version],
        ) {
            tracing::error!("failed to record listing stats: {e}");
        }
    }

    fn sync_and_monitor(&self) -> mpsc::UnboundedReceiver<FleetEvent> {
        self.bus.subscribe_into_mpsc()
    }

    async fn publish_local_registered(&self, snapshot: LocalServerSnapshot) {
        for event in snapshot_to_event(snapshot) {
            self.bus.publish(event);
        }
    }

    async fn publish_local_removed(&self, server_id: &str) {
        self.bus.publish(FleetEvent::ExternalServerRemoved { server_id: server_id.to_string() });
    }

    async fn forward_to_external(&self, server_id: &str, instruction: ExternalInstruction) {
        self.bus.publish(instruction_to_event(server_id, instruction));
    }
}

pub type SharedDatabase = Arc<dyn Database>;
