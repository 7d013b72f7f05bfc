//! Connectivity probes: the STUN server, the relay (TURN-like) server, and
//! the coordinator's own outbound dial used to classify a freshly
//! registered server and to drive the connect method ladder.
//! All three are external collaborators — out of scope — so this
//! module only defines the trait boundary the
//! [`VerifyFlow`](crate::verify) and [`ConnectFlow`](crate::connect) depend
//! on.

use std::net::SocketAddr;

use async_trait::async_trait;

/// A relay allocation: where to connect, and the session token the relay
/// uses to pair the two legs.
#[derive(Debug, Clone)]
pub struct RelayAllocation {
    pub addr: SocketAddr,
    pub session_token: String,
}

#[async_trait]
pub trait ConnectivityProbes: Send + Sync {
    /// Attempt to reach the server directly on its advertised port. Returns
    /// the externally-observed `ip:port` on success.
    async fn probe_direct(&self, server_id: &str, server_port: u16) -> Option<SocketAddr>;

    /// Ask the server to send STUN packets to the STUN server. Outcomes
    /// arrive asynchronously as `SERCLI_STUN_RESULT` frames routed back to
    /// the flow that minted `token`.
    async fn request_stun(&self, server_id: &str, token: &str);

    /// Register the server with the relay fallback, returning an
    /// allocation on success.
    async fn allocate_relay(&self, server_id: &str) -> Option<RelayAllocation>;
}

/// A probe set that never succeeds — every registration ends up
/// `ISOLATED`. Useful as the default when no real STUN/TURN/dial
/// integration is wired in, and as a baseline fake in tests.
#[derive(Default)]
pub struct NullProbes;

#[async_trait]
impl ConnectivityProbes for NullProbes {
    async fn probe_direct(&self, _server_id: &str, _server_port: u16) -> Option<SocketAddr> {
        None
    }

    async fn request_stun(&self, _server_id: &str, _token: &str) {}

    async fn allocate_relay(&self, _server_id: &str) -> Option<RelayAllocation> {
        None
    }
}
