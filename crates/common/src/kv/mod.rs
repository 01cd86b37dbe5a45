//! Key/value store facade.
//!
//! The tracker keeps all cross-replica state (heartbeat records, the
//! shared parameter record, liveness-witness keys, the scan lock) in an
//! external consensus-backed KV store. This module defines the typed
//! facade the rest of the service programs against, plus two
//! implementations:
//!
//! - [`etcd::EtcdKv`]: production backend over the etcd v3 JSON
//!   gateway
//! - [`mem::MemKv`]: in-memory backend for tests and single-instance
//!   bring-up
//!
//! ## Guarantees required of a backend
//!
//! - Linearizable single-key get/put/delete
//! - Inclusive-start range reads
//! - A fleet-wide try-lock with automatic release when the holder
//!   disappears (lease-bound)
//! - Ephemeral keys bound to the session lifetime
//!
//! ## Fail-closed startup
//!
//! A backend must not hand out a working handle until an initialization
//! put/get has succeeded; until then every operation returns
//! [`Error::KvUnavailable`](crate::Error::KvUnavailable).

use async_trait::async_trait;

use crate::Result;

pub mod etcd;
pub mod mem;

pub use etcd::EtcdKv;
pub use mem::MemKv;

/// One key/value pair from a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

/// The KV facade. All operations are async; any of them may suspend on
/// the network.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a single key. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a key, overwriting any prior value.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Range read, inclusive of `start`, exclusive of `end`, sorted by
    /// key.
    async fn get_range(&self, start: &str, end: &str) -> Result<Vec<KvPair>>;

    /// Try to take the fleet-wide scan lock. The lock auto-releases
    /// after `ttl_secs` if the holder disappears. Returns
    /// [`Error::LockContended`](crate::Error::LockContended) immediately
    /// when another instance holds it.
    async fn dist_timed_lock(&self, ttl_secs: i64) -> Result<()>;

    /// Release the fleet-wide scan lock.
    async fn dist_unlock(&self) -> Result<()>;

    /// Store a key bound to this session; it disappears when the
    /// session ends or its keepalive lapses.
    async fn ephemeral_put(&self, key: &str) -> Result<()>;

    /// Refresh the session backing ephemeral keys. Call periodically
    /// from a background worker.
    async fn session_keepalive(&self) -> Result<()>;
}
