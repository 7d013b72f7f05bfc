//! The server registry: one logical record per invite code, either
//! [`LocalServer`] (peer session held by this instance) or
//! [`ExternalServer`] (owned by a sibling instance, observed via the
//! database).
//!
//! Local and External are two variants of one [`Server`] enum rather than
//! trait objects — matching the "polymorphism between Local and External"
//! design note: one surface offers `update`/`update_newgrf`/`update_direct_ip`
//! on both variants, a handful of operations (STUN/TURN signalling) are
//! Local-only and log-and-return on an External target instead of panicking.

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::database::SharedDatabase;
use crate::error::{DatabaseError, RegistryError};
use crate::protocol::{ConnectionType, DirectIp, GameType, NewGrfRef, ServerInfo};

pub struct LocalServer {
    pub server_id: String,
    pub game_type: GameType,
    pub connection_type: ConnectionType,
    pub info: Option<ServerInfo>,
    pub newgrfs: Vec<NewGrfRef>,
    pub direct_ip: DirectIp,
    pub session_id: String,
    pub server_port: u16,
    pub invite_code_secret: String,
}

pub struct ExternalServer {
    pub server_id: String,
    pub game_type: GameType,
    pub connection_type: ConnectionType,
    pub info: Option<ServerInfo>,
    pub newgrfs: Vec<NewGrfRef>,
    pub direct_ip: DirectIp,
}

pub enum Server {
    Local(LocalServer),
    External(ExternalServer),
}

impl Server {
    pub fn server_id(&self) -> &str {
        match self {
            Server::Local(s) => &s.server_id,
            Server::External(s) => &s.server_id,
        }
    }

    pub fn game_type(&self) -> GameType {
        match self {
            Server::Local(s) => s.game_type,
            Server::External(s) => s.game_type,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Server::Local(s) => s.connection_type,
            Server::External(s) => s.connection_type,
        }
    }

    pub fn set_connection_type(&mut self, ct: ConnectionType) {
        match self {
            Server::Local(s) => s.connection_type = ct,
            Server::External(s) => s.connection_type = ct,
        }
    }

    pub fn info(&self) -> Option<&ServerInfo> {
        match self {
            Server::Local(s) => s.info.as_ref(),
            Server::External(s) => s.info.as_ref(),
        }
    }

    pub fn direct_ip(&self) -> &DirectIp {
        match self {
            Server::Local(s) => &s.direct_ip,
            Server::External(s) => &s.direct_ip,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Server::Local(_))
    }

    pub fn local(&self) -> Option<&LocalServer> {
        match self {
            Server::Local(s) => Some(s),
            Server::External(_) => None,
        }
    }

    /// Update opaque gameplay metadata. Valid for both variants.
    pub fn update(&mut self, info: ServerInfo) {
        match self {
            Server::Local(s) => s.info = Some(info),
            Server::External(s) => s.info = Some(info),
        }
    }

    /// Replace the NewGRF list. Valid for both variants.
    pub fn update_newgrf(&mut self, newgrfs: Vec<NewGrfRef>) {
        match self {
            Server::Local(s) => s.newgrfs = newgrfs,
            Server::External(s) => s.newgrfs = newgrfs,
        }
    }

    /// Record an observed direct-connect endpoint. Valid for both variants.
    pub fn update_direct_ip(&mut self, addr: std::net::SocketAddr) {
        match self {
            Server::Local(s) => s.direct_ip.set(addr),
            Server::External(s) => s.direct_ip.set(addr),
        }
    }

    /// Local-only: ask the peer to send STUN probes. Logging and returning
    /// on an External target is the documented dispatch-error behavior
    /// rather than a panic.
    pub fn session_id(&self) -> Result<&str, RegistryError> {
        match self {
            Server::Local(s) => Ok(&s.session_id),
            Server::External(s) => {
                tracing::error!(
                    server_id = %s.server_id,
                    "internal error: operation requiring a live session called on an external server"
                );
                Err(RegistryError::NotLocal(s.server_id.clone()))
            }
        }
    }
}

/// One logical record per server-id; Local and External are mutually
/// exclusive at any instant. Iteration yields Locals first in insertion
/// order, then Externals, matching the registry listing contract.
pub struct ServerRegistry {
    servers: Mutex<IndexMap<String, Server>>,
    database: SharedDatabase,
}

impl ServerRegistry {
    pub fn new(database: SharedDatabase) -> Self {
        Self { servers: Mutex::new(IndexMap::new()), database }
    }

    /// Allocate the next ordinal for a fresh invite code, delegating to the
    /// database's monotonic counter. Used only by the verify flow when no
    /// valid invite code/secret pair was presented at registration.
    pub async fn next_ordinal(&self) -> Result<u64, DatabaseError> {
        self.database.get_server_id().await
    }

    /// Insert or replace a Local server. Refuses (logging, not erroring the
    /// caller) if the slot is currently External — a cross-instance claim
    /// is never downgraded by a local race.
    pub fn put_local(&self, server: LocalServer) -> Result<(), RegistryError> {
        let mut servers = self.servers.lock();
        if let Some(existing) = servers.get(&server.server_id)
            && !existing.is_local()
        {
            let err = RegistryError::ExternalOwned(server.server_id.clone());
            tracing::error!("{err}");
            return Err(err);
        }
        servers.insert(server.server_id.clone(), Server::Local(server));
        Ok(())
    }

    /// Create-on-miss, update-on-hit (only if currently External) entry
    /// point for database-sourced servers.
    pub fn put_external(&self, server_id: &str) -> Result<(), RegistryError> {
        let mut servers = self.servers.lock();
        match servers.get(server_id) {
            Some(Server::Local(_)) => {
                tracing::error!(
                    server_id,
                    "internal error: update_external_server() called on a server managed by us"
                );
                Err(RegistryError::NotLocal(server_id.to_string()))
            }
            Some(Server::External(_)) => Ok(()),
            None => {
                servers.insert(
                    server_id.to_string(),
                    Server::External(ExternalServer {
                        server_id: server_id.to_string(),
                        game_type: GameType::Public,
                        connection_type: ConnectionType::Unknown,
                        info: None,
                        newgrfs: Vec::new(),
                        direct_ip: DirectIp::default(),
                    }),
                );
                Ok(())
            }
        }
    }

    pub fn with_server<R>(&self, server_id: &str, f: impl FnOnce(&Server) -> R) -> Option<R> {
        self.servers.lock().get(server_id).map(f)
    }

    pub fn with_server_mut<R>(
        &self,
        server_id: &str,
        f: impl FnOnce(&mut Server) -> R,
    ) -> Option<R> {
        self.servers.lock().get_mut(server_id).map(f)
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.lock().contains_key(server_id)
    }

    /// Drop a server from the registry. Callers (the Coordinator) are
    /// responsible for cancelling in-flight flows referencing it; this
    /// method only owns the registry's own state.
    pub fn remove(&self, server_id: &str) -> Option<Server> {
        self.servers.lock().shift_remove(server_id)
    }

    /// Locals first in insertion order, then Externals, as a snapshot of
    /// cloned listing-relevant fields. Cloning (rather than returning
    /// references under the lock) keeps the lock out of the `.await`s
    /// downstream in the listing handler.
    pub fn listing_snapshot(&self) -> Vec<ListingEntry> {
        let servers = self.servers.lock();
        let (mut locals, mut externals) = (Vec::new(), Vec::new());
        for server in servers.values() {
            let entry = ListingEntry {
                server_id: server.server_id().to_string(),
                game_type: server.game_type(),
                connection_type: server.connection_type(),
                info: server.info().cloned(),
            };
            if server.is_local() {
                locals.push(entry);
            } else {
                externals.push(entry);
            }
        }
        locals.append(&mut externals);
        locals
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub server_id: String,
    pub game_type: GameType,
    pub connection_type: ConnectionType,
    pub info: Option<ServerInfo>,
}
