//! In-process integration coverage for the six end-to-end scenarios: drive
//! a real [`Coordinator`] plus a [`LocalDatabase`] fake through the session
//! dispatch surface and assert on the frames captured off each session's
//! outbox — real structs end to end, no mocking of the core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use game_coordinator::config::CoordinatorConfig;
use game_coordinator::coordinator::Coordinator;
use game_coordinator::database::{FleetBus, FleetEvent, LocalDatabase};
use game_coordinator::error::GcErrorCode;
use game_coordinator::probes::{ConnectivityProbes, RelayAllocation};
use game_coordinator::protocol::{ConnectionType, GameType, IncomingFrame, OutgoingFrame};
use game_coordinator::registry::LocalServer;
use game_coordinator::token::{self, TokenSide};

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        shared_secret: "test-shared-secret".to_string(),
        socks_proxy: None,
        listen: "127.0.0.1:0".parse().unwrap(),
        method_timeout: Duration::from_millis(200),
        log_json: false,
    }
}

/// A probe set whose direct/relay answers each test dials in explicitly.
/// STUN classification during registration is a separate backchannel
/// ([`FleetBus::publish`]) that tests drive directly, matching how the
/// real STUN server reports results rather than the probe call itself.
struct ScriptedProbes {
    direct: Option<SocketAddr>,
    relay: Option<RelayAllocation>,
}

#[async_trait]
impl ConnectivityProbes for ScriptedProbes {
    async fn probe_direct(&self, _server_id: &str, _server_port: u16) -> Option<SocketAddr> {
        self.direct
    }

    async fn request_stun(&self, _server_id: &str, _token: &str) {}

    async fn allocate_relay(&self, _server_id: &str) -> Option<RelayAllocation> {
        self.relay.clone()
    }
}

fn scripted(direct: Option<SocketAddr>) -> Arc<ScriptedProbes> {
    Arc::new(ScriptedProbes { direct, relay: None })
}

async fn next_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutgoingFrame>) -> OutgoingFrame {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting for a frame").expect("outbox closed")
}

#[tokio::test]
async fn scenario_1_fresh_registration_direct() {
    let probes = scripted(Some("198.51.100.1:3979".parse().unwrap()));
    let coordinator = Coordinator::new(test_config(), probes, Arc::new(LocalDatabase::new()));

    let mut server_rx = coordinator.accept_session("server-session".to_string());
    coordinator
        .dispatch(
            "server-session",
            IncomingFrame::ServerRegister {
                protocol_version: 4,
                game_type: GameType::Public,
                server_port: 3979,
                invite_code: None,
                invite_code_secret: None,
            },
        )
        .await;

    let ack = next_frame(&mut server_rx).await;
    let invite_code = match ack {
        OutgoingFrame::RegisterAck { connection_type, invite_code, invite_code_secret, .. } => {
            assert_eq!(connection_type, ConnectionType::Direct);
            assert_eq!(invite_code, "+0000001");
            assert!(invite_code_secret.is_some(), "fresh registration mints a secret");
            invite_code
        }
        other => panic!("unexpected frame: {other:?}"),
    };

    // Registration alone leaves `info` unset, so the server is still
    // excluded from listings until a SERVER_UPDATE arrives.
    coordinator
        .dispatch(
            "server-session",
            IncomingFrame::ServerUpdate {
                protocol_version: 4,
                newgrfs: Vec::new(),
                info: game_coordinator::protocol::ServerInfo {
                    openttd_version: "14.1".to_string(),
                    extra: serde_json::json!({}),
                },
            },
        )
        .await;

    let mut client_rx = coordinator.accept_session("client-session".to_string());
    coordinator
        .dispatch(
            "client-session",
            IncomingFrame::ClientListing {
                protocol_version: 4,
                game_info_version: 6,
                openttd_version: "14.1".to_string(),
                newgrf_lookup_table_cursor: 0,
            },
        )
        .await;

    match next_frame(&mut client_rx).await {
        OutgoingFrame::Listing { servers, .. } => {
            assert_eq!(servers.len(), 1);
            assert_eq!(servers[0].server_id, invite_code);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn scenario_2_and_3_reregistration_secret_validity() {
    let probes = scripted(Some("198.51.100.1:3979".parse().unwrap()));
    let coordinator = Coordinator::new(test_config(), probes, Arc::new(LocalDatabase::new()));

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
    let (code, secret) = match next_frame(&mut rx).await {
        OutgoingFrame::RegisterAck { invite_code, invite_code_secret, .. } => (invite_code, invite_code_secret.unwrap()),
        other => panic!("unexpected frame: {other:?}"),
    };
    coordinator.disconnect_session("server-1");

    // Scenario 2: a valid secret reclaims the same code and mints no new one.
    let mut rx2 = coordinator.accept_session("server-2".to_string());
    coordinator
        .dispatch(
            "server-2",
            IncomingFrame::ServerRegister {
                protocol_version: 4,
                game_type: GameType::Public,
                server_port: 3979,
                invite_code: Some(code.clone()),
                invite_code_secret: Some(secret.clone()),
            },
        )
        .await;
    match next_frame(&mut rx2).await {
        OutgoingFrame::RegisterAck { invite_code, invite_code_secret, .. } => {
            assert_eq!(invite_code, code);
            assert!(invite_code_secret.is_none());
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    coordinator.disconnect_session("server-2");

    // Scenario 3: a tampered secret is rejected, forcing a fresh ordinal/code.
    let mut rx3 = coordinator.accept_session("server-3".to_string());
    coordinator
        .dispatch(
            "server-3",
            IncomingFrame::ServerRegister {
                protocol_version: 4,
                game_type: GameType::Public,
                server_port: 3979,
                invite_code: Some(code.clone()),
                invite_code_secret: Some("tampered-secret-value".to_string()),
            },
        )
        .await;
    match next_frame(&mut rx3).await {
        OutgoingFrame::RegisterAck { invite_code, invite_code_secret, .. } => {
            assert_ne!(invite_code, code);
            assert!(invite_code_secret.is_some());
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn scenario_4_stun_success_on_third_method() {
    let bus = FleetBus::new();
    let coordinator = Coordinator::new(test_config(), scripted(None), Arc::new(LocalDatabase::with_bus(bus.clone())));
    let shared = coordinator.shared();

    // The server is already known with both direct endpoints on file (e.g.
    // from a prior verify pass) but is classified STUN, so DIRECT_IPV6 and
    // DIRECT_IPV4 are attempted and fail at the network before STUN succeeds.
    shared
        .registry
        .put_local(LocalServer {
            server_id: "+0000001".to_string(),
            game_type: GameType::Public,
            connection_type: ConnectionType::Stun,
            info: None,
            newgrfs: Vec::new(),
            direct_ip: game_coordinator::protocol::DirectIp {
                v4: Some("198.51.100.1:3979".parse().unwrap()),
                v6: Some("[2001:db8::1]:3979".parse().unwrap()),
            },
            session_id: "server-session".to_string(),
            server_port: 3979,
            invite_code_secret: "irrelevant".to_string(),
        })
        .unwrap();
    let mut server_rx = coordinator.accept_session("server-session".to_string());
    let mut client_rx = coordinator.accept_session("client-session".to_string());

    coordinator
        .dispatch(
            "client-session",
            IncomingFrame::ClientConnect { protocol_version: 4, invite_code: "+0000001".to_string() },
        )
        .await;

    let client_token = match next_frame(&mut client_rx).await {
        OutgoingFrame::Connecting { client_token, .. } => client_token,
        other => panic!("unexpected frame: {other:?}"),
    };
    let (side, raw_token) = token::split_prefix(&client_token).expect("client token is side-prefixed");
    assert_eq!(side, TokenSide::Client);
    let raw_token = raw_token.to_string();

    // Methods 1 (v6) and 2 (v4) are attempted and fail.
    for tracking_number in [0u8, 1u8] {
        assert!(matches!(next_frame(&mut client_rx).await, OutgoingFrame::ConnectDirect { .. }));
        coordinator
            .dispatch(
                "client-session",
                IncomingFrame::ConnectFailed { protocol_version: 4, token: client_token.clone(), tracking_number },
            )
            .await;
    }

    // Method 3 (STUN) asks both sides to probe, then this test plays the
    // STUN server's role and reports both observed endpoints on the bus.
    assert!(matches!(next_frame(&mut client_rx).await, OutgoingFrame::StunRequest { .. }));
    assert!(matches!(next_frame(&mut server_rx).await, OutgoingFrame::StunRequest { .. }));

    bus.publish(FleetEvent::StunResult {
        token: token::prefixed(&raw_token, TokenSide::Client),
        interface_number: 0,
        peer_addr: "203.0.113.5:9001".parse().unwrap(),
    });
    bus.publish(FleetEvent::StunResult {
        token: token::prefixed(&raw_token, TokenSide::Server),
        interface_number: 0,
        peer_addr: "203.0.113.6:9002".parse().unwrap(),
    });

    let client_connect = next_frame(&mut client_rx).await;
    assert!(matches!(client_connect, OutgoingFrame::StunConnect { tracking_number: 2, .. }));
    let server_connect = next_frame(&mut server_rx).await;
    assert!(matches!(server_connect, OutgoingFrame::StunConnect { tracking_number: 2, .. }));

    coordinator
        .dispatch("client-session", IncomingFrame::ClientConnected { protocol_version: 4, token: client_token })
        .await;

    // Give the flow task a moment to drop its token after success.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(shared.tokens.is_empty());
}

#[tokio::test]
async fn scenario_5_all_methods_fail() {
    let coordinator = Coordinator::new(test_config(), scripted(None), Arc::new(LocalDatabase::new()));
    let shared = coordinator.shared();

    shared
        .registry
        .put_local(LocalServer {
            server_id: "+0000002".to_string(),
            game_type: GameType::Public,
            connection_type: ConnectionType::Turn,
            info: None,
            newgrfs: Vec::new(),
            direct_ip: Default::default(),
            session_id: "server-session".to_string(),
            server_port: 3979,
            invite_code_secret: "irrelevant".to_string(),
        })
        .unwrap();
    coordinator.accept_session("server-session".to_string());
    let mut client_rx = coordinator.accept_session("client-session".to_string());

    coordinator
        .dispatch(
            "client-session",
            IncomingFrame::ClientConnect { protocol_version: 4, invite_code: "+0000002".to_string() },
        )
        .await;

    assert!(matches!(next_frame(&mut client_rx).await, OutgoingFrame::Connecting { .. }));

    // Only TURN is eligible (no direct endpoints, classified TURN); the
    // relay probe fails too, so the ladder exhausts.
    match next_frame(&mut client_rx).await {
        OutgoingFrame::Error { error, .. } => assert_eq!(error, GcErrorCode::NoConnection),
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(shared.tokens.is_empty());
}

#[tokio::test]
async fn scenario_6_invalid_invite_code() {
    let coordinator = Coordinator::new(test_config(), scripted(None), Arc::new(LocalDatabase::new()));

    let mut rx = coordinator.accept_session("client-session".to_string());
    coordinator
        .dispatch(
            "client-session",
            IncomingFrame::ClientConnect { protocol_version: 4, invite_code: "+deadbee".to_string() },
        )
        .await;

    match next_frame(&mut rx).await {
        OutgoingFrame::Error { error, detail, .. } => {
            assert_eq!(error, GcErrorCode::InvalidInviteCode);
            assert_eq!(detail, "+deadbee");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}
