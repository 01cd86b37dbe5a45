//! In-memory [`KvStore`] for tests and single-instance bring-up.
//!
//! Semantics mirror the etcd backend closely enough for the service
//! logic to be exercised unchanged: sorted range reads, a single
//! try-lock, ephemeral keys tied to a simulated session. Test-only
//! controls let a suite drop the session (all ephemeral keys vanish) or
//! force operations to fail.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::kv::{KvPair, KvStore};

#[derive(Default)]
struct MemInner {
    map: BTreeMap<String, String>,
    ephemeral: HashSet<String>,
    locked: bool,
    fail_ops: bool,
}

#[derive(Default)]
pub struct MemKv {
    inner: Mutex<MemInner>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the session lease lapsing: every ephemeral key is
    /// removed, as etcd would do when the holder disappears.
    pub fn drop_session(&self) {
        let mut inner = self.inner.lock();
        let dead: Vec<String> = inner.ephemeral.drain().collect();
        for k in dead {
            inner.map.remove(&k);
        }
    }

    /// Release the lock as if the holder's lease expired.
    pub fn break_lock(&self) {
        self.inner.lock().locked = false;
    }

    /// Make every subsequent operation fail with a retriable error.
    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().fail_ops = fail;
    }

    /// Number of stored keys (test convenience).
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, inner: &MemInner) -> Result<()> {
        if inner.fail_ops {
            Err(Error::KvUnavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        self.check(&inner)?;
        Ok(inner.map.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner)?;
        inner.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner)?;
        inner.map.remove(key);
        inner.ephemeral.remove(key);
        Ok(())
    }

    async fn get_range(&self, start: &str, end: &str) -> Result<Vec<KvPair>> {
        let inner = self.inner.lock();
        self.check(&inner)?;
        Ok(inner
            .map
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| KvPair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn dist_timed_lock(&self, _ttl_secs: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner)?;
        if inner.locked {
            return Err(Error::LockContended);
        }
        inner.locked = true;
        Ok(())
    }

    async fn dist_unlock(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner)?;
        inner.locked = false;
        Ok(())
    }

    async fn ephemeral_put(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner)?;
        inner.map.insert(key.to_string(), "alive".to_string());
        inner.ephemeral.insert(key.to_string());
        Ok(())
    }

    async fn session_keepalive(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.check(&inner)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put_delete() {
        let kv = MemKv::new();
        assert_eq!(kv.get("a").await.unwrap(), None);
        kv.put("a", "1").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
        // deleting a missing key is fine
        kv.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_range_is_sorted_and_bounded() {
        let kv = MemKv::new();
        kv.put("x0c0s0b0n0", "a").await.unwrap();
        kv.put("x1c0s0b0n0", "b").await.unwrap();
        kv.put("params", "p").await.unwrap();
        kv.put("zzz", "z").await.unwrap();

        let got = kv.get_range("x0", "xz").await.unwrap();
        let keys: Vec<&str> = got.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["x0c0s0b0n0", "x1c0s0b0n0"]);
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let kv = MemKv::new();
        kv.dist_timed_lock(10).await.unwrap();
        assert!(matches!(
            kv.dist_timed_lock(10).await,
            Err(Error::LockContended)
        ));
        kv.dist_unlock().await.unwrap();
        kv.dist_timed_lock(10).await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_lock_reacquirable() {
        let kv = MemKv::new();
        kv.dist_timed_lock(10).await.unwrap();
        kv.break_lock();
        kv.dist_timed_lock(10).await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_keys_die_with_session() {
        let kv = MemKv::new();
        kv.ephemeral_put("lifekey-123").await.unwrap();
        kv.put("durable", "v").await.unwrap();
        assert!(kv.get("lifekey-123").await.unwrap().is_some());

        kv.drop_session();
        assert!(kv.get("lifekey-123").await.unwrap().is_none());
        assert!(kv.get("durable").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let kv = MemKv::new();
        kv.set_failing(true);
        assert!(kv.get("a").await.is_err());
        assert!(kv.put("a", "1").await.is_err());
        kv.set_failing(false);
        assert!(kv.put("a", "1").await.is_ok());
    }
}
