//! Error type shared across the hbmon workspace.
//!
//! One error domain is enough for this service: every failure is either
//! a KV problem, an outbound HTTP problem, or bad input. Lock
//! contention gets its own variant because it is not an error for the
//! overdue checker, just a signal that another replica won the scan.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The KV store has not completed its startup initialization, or a
    /// request to it failed in a way that should be retried.
    #[error("key/value store unavailable: {0}")]
    KvUnavailable(String),

    /// A KV operation failed permanently (bad request, decode failure).
    #[error("key/value operation failed: {0}")]
    Kv(String),

    /// The fleet-wide distributed lock is held by another replica.
    /// Normal mode of operation in a multi-replica deployment.
    #[error("distributed lock is held by another instance")]
    LockContended,

    /// An outbound request to the hardware state manager failed.
    #[error("state manager request failed: {0}")]
    StateMgr(String),

    /// The event bus rejected a write or is not connected.
    #[error("event bus write failed: {0}")]
    Bus(String),

    /// A component name did not parse as a valid HMS name.
    #[error("invalid component name '{0}'")]
    InvalidComponent(String),

    /// JSON encode/decode failure on data we produced ourselves.
    #[error("serialization failed: {0}")]
    Serde(String),
}

impl Error {
    /// True if the failure is transient and the operation may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::KvUnavailable(_) | Error::StateMgr(_) | Error::Bus(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}
