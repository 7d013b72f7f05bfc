//! Frame and domain types exchanged across the coordinator protocol's wire
//! boundary.
//!
//! The byte-level codec (framing, handshake, transport) is an external
//! collaborator — out of scope here, per the expanded spec's ambient-stack
//! boundary. This module only defines the *shapes* so the core stays
//! type-safe; something upstream is responsible for turning bytes into
//! [`IncomingFrame`] and [`OutgoingFrame`] back into bytes.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::GcErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameType {
    Public,
    InviteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Unknown,
    Direct,
    Stun,
    Turn,
    Isolated,
}

/// Gameplay metadata the core treats opaquely except for `openttd_version`,
/// which drives listing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub openttd_version: String,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// A single NewGRF reference as carried in `SERVER_UPDATE`/listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGrfRef {
    pub grfid: u32,
    pub md5sum: String,
}

/// A stable, centrally-indexed NewGRF table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGrfEntry {
    pub grfid: u32,
    pub md5sum: String,
    pub name: String,
}

/// Known direct-connect endpoints for a server, split by address family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectIp {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl DirectIp {
    pub fn set(&mut self, addr: SocketAddr) {
        if addr.is_ipv6() {
            self.v6 = Some(addr);
        } else {
            self.v4 = Some(addr);
        }
    }
}

/// The connect-flow method ladder, in evaluation order. The
/// discriminant is the wire `tracking_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectMethod {
    DirectIpv6 = 0,
    DirectIpv4 = 1,
    Stun = 2,
    Turn = 3,
}

impl ConnectMethod {
    pub const LADDER: [ConnectMethod; 4] = [
        ConnectMethod::DirectIpv6,
        ConnectMethod::DirectIpv4,
        ConnectMethod::Stun,
        ConnectMethod::Turn,
    ];

    pub fn tracking_number(self) -> u8 {
        self as u8
    }
}

/// Frames consumed by the coordinator, already demultiplexed onto a
/// `session_id` by whatever terminates the wire codec.
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    ServerRegister {
        protocol_version: u8,
        game_type: GameType,
        server_port: u16,
        invite_code: Option<String>,
        invite_code_secret: Option<String>,
    },
    ServerUpdate {
        protocol_version: u8,
        newgrfs: Vec<NewGrfRef>,
        info: ServerInfo,
    },
    ClientListing {
        protocol_version: u8,
        game_info_version: u16,
        openttd_version: String,
        newgrf_lookup_table_cursor: u32,
    },
    ClientConnect {
        protocol_version: u8,
        invite_code: String,
    },
    ConnectFailed {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
    },
    ClientConnected {
        protocol_version: u8,
        token: String,
    },
    StunResult {
        protocol_version: u8,
        token: String,
        interface_number: u8,
        result: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ListedServer {
    pub server_id: String,
    pub game_type: GameType,
    pub connection_type: ConnectionType,
    pub info: ServerInfo,
}

/// Frames produced by the coordinator, addressed to a `session_id`.
#[derive(Debug, Clone)]
pub enum OutgoingFrame {
    Error {
        protocol_version: u8,
        error: GcErrorCode,
        detail: String,
    },
    Connecting {
        protocol_version: u8,
        client_token: String,
        invite_code: String,
    },
    RegisterAck {
        protocol_version: u8,
        connection_type: ConnectionType,
        invite_code: String,
        /// Only present when a fresh code/secret pair was minted.
        invite_code_secret: Option<String>,
    },
    Listing {
        protocol_version: u8,
        game_info_version: u16,
        servers: Vec<ListedServer>,
    },
    NewGrfLookup {
        protocol_version: u8,
        cursor: u32,
        table_delta: Vec<(u32, NewGrfEntry)>,
    },
    /// Tell a client or server to attempt a direct TCP connect.
    ConnectDirect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        addr: SocketAddr,
    },
    /// Ask a server to send STUN probes, so the coordinator can observe its
    /// external endpoints.
    StunRequest {
        protocol_version: u8,
        token: String,
    },
    /// Tell a peer to STUN-connect to the other side's observed endpoint.
    StunConnect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        interface_number: u8,
        peer_addr: SocketAddr,
    },
    /// Hand both sides a relay endpoint and session token.
    TurnConnect {
        protocol_version: u8,
        token: String,
        tracking_number: u8,
        relay_addr: SocketAddr,
        relay_token: String,
    },
}
