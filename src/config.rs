//! Process-wide configuration: captured once at startup and handed to the
//! [`Coordinator`](crate::coordinator::Coordinator) as an immutable value,
//! rather than kept as ad-hoc module-level globals.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "game-coordinator", about = "Rendezvous service for NAT-traversal between game clients and servers")]
pub struct CoordinatorConfig {
    /// Validates invite-code secrets. Startup refuses to proceed without one.
    #[arg(long, env = "GC_SHARED_SECRET")]
    pub shared_secret: String,

    /// SOCKS proxy used when the coordinator dials game servers directly.
    #[arg(long, env = "GC_SOCKS_PROXY")]
    pub socks_proxy: Option<String>,

    /// Address the coordinator's wire listener binds to.
    #[arg(long, default_value = "0.0.0.0:3976")]
    pub listen: SocketAddr,

    /// Budget for a single connect-ladder method before it's abandoned.
    #[arg(long = "method-timeout-secs", default_value = "5", value_parser = parse_secs)]
    pub method_timeout: Duration,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, env = "GC_LOG_JSON")]
    pub log_json: bool,
}

fn parse_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}
