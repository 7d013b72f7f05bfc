//! Typed errors for the coordinator's leaf modules.
//!
//! Leaf modules return `thiserror` enums; `main.rs` collapses startup
//! failures into `anyhow::Result`. Nothing in the flow/dispatch layer
//! re-raises these past a task boundary — see the error handling design
//! in the expanded spec.

#[derive(Debug, thiserror::Error)]
pub enum InviteCodeError {
    #[error("ordinal {0} does not fit the fixed-width invite code format")]
    OrdinalOverflow(u64),
    #[error("malformed invite code: {0:?}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("server {0:?} is externally owned; refusing to downgrade to local")]
    ExternalOwned(String),
    #[error("server {0:?} is not known to this registry")]
    Unknown(String),
    #[error("operation requires a local server, but {0:?} is external")]
    NotLocal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Typed `GC_ERROR` codes sent back to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GcErrorCode {
    InvalidInviteCode,
    NoConnection,
    TooManyGames,
    RegistrationFailed,
}

