//! Error type shared by every service in the sync engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PosError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure talking to the origin server.
    #[error("network error: {0}")]
    Http(String),

    /// The server answered, but not with something we can apply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Rejected at authoring time; never queued.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("background bridge is not running")]
    BridgeClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PosError {
    /// Transient failures are retried by the next timer tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, PosError::Http(_) | PosError::Protocol(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PosError::LockPoisoned(err.to_string())
    }
}
