//! etcd-backed [`KvStore`] implementation.
//!
//! Talks to the etcd v3 JSON gateway (`/v3/kv/*`, `/v3/lease/*`) with a
//! plain HTTP client; keys and values travel base64-encoded per the
//! gateway contract.
//!
//! The distributed lock is a lease-bound try-lock: a transaction that
//! puts the lock key only if its create revision is zero. The lease TTL
//! is the caller-supplied lock timeout, so a replica that dies mid-scan
//! releases the lock automatically when its lease lapses.
//!
//! Ephemeral keys hang off a separate long-lived session lease that a
//! background worker refreshes via [`KvStore::session_keepalive`]; when
//! the process dies the lease expires and every key bound to it
//! disappears.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kv::{KvPair, KvStore};

/// TTL for the session lease backing ephemeral keys. The keepalive
/// worker must refresh faster than this.
const SESSION_LEASE_TTL_SECS: i64 = 10;

/// Key stored at open time to prove the connection works. The facade is
/// fail-closed: `open()` does not return a handle until this put
/// succeeds.
pub const KV_INIT_KEY: &str = "HBMON_HEALTH_KEY";
pub const KV_INIT_VAL: &str = "HBMON_OK";

struct HeldLock {
    lease_id: i64,
}

pub struct EtcdKv {
    base: String,
    http: reqwest::Client,
    lock_key: String,
    /// Session lease id for ephemeral keys; 0 until granted.
    session_lease: Mutex<i64>,
    /// Currently held scan lock, if any.
    lock: Mutex<Option<HeldLock>>,
}

impl EtcdKv {
    /// Open a connection to the gateway at `base` (e.g.
    /// `http://etcd:2379`) and verify it with the init put. Errors are
    /// retriable; callers loop until this succeeds.
    pub async fn open(base: &str, lock_name: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::KvUnavailable(e.to_string()))?;

        let kv = Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            lock_key: lock_name.to_string(),
            session_lease: Mutex::new(0),
            lock: Mutex::new(None),
        };

        kv.put(KV_INIT_KEY, KV_INIT_VAL).await?;
        debug!("KV init key stored, etcd connection verified");
        Ok(kv)
    }

    async fn call(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}/v3/{}", self.base, path);
        let rsp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::KvUnavailable(format!("{}: {}", path, e)))?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::KvUnavailable(format!("{}: HTTP {}", path, status)));
        }
        rsp.json::<Value>()
            .await
            .map_err(|e| Error::Kv(format!("{}: bad response body: {}", path, e)))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
        let rsp = self.call("lease/grant", json!({ "TTL": ttl_secs.to_string() })).await?;
        parse_i64(&rsp["ID"]).ok_or_else(|| Error::Kv("lease/grant: no lease ID".into()))
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<()> {
        self.call("lease/revoke", json!({ "ID": lease_id.to_string() })).await?;
        Ok(())
    }

    async fn session_lease_id(&self) -> Result<i64> {
        let cur = *self.session_lease.lock();
        if cur != 0 {
            return Ok(cur);
        }
        let id = self.lease_grant(SESSION_LEASE_TTL_SECS).await?;
        *self.session_lease.lock() = id;
        Ok(id)
    }
}

/// The gateway encodes int64 fields as JSON strings.
fn parse_i64(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn b64(s: &str) -> String {
    B64.encode(s.as_bytes())
}

fn un_b64(v: &Value) -> Result<String> {
    let s = v.as_str().ok_or_else(|| Error::Kv("expected base64 string".into()))?;
    let bytes = B64
        .decode(s)
        .map_err(|e| Error::Kv(format!("bad base64 in response: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::Kv(format!("non-utf8 value: {}", e)))
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let rsp = self.call("kv/range", json!({ "key": b64(key) })).await?;
        match rsp["kvs"].as_array() {
            Some(kvs) if !kvs.is_empty() => Ok(Some(un_b64(&kvs[0]["value"])?)),
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.call("kv/put", json!({ "key": b64(key), "value": b64(value) }))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.call("kv/deleterange", json!({ "key": b64(key) })).await?;
        Ok(())
    }

    async fn get_range(&self, start: &str, end: &str) -> Result<Vec<KvPair>> {
        let rsp = self
            .call(
                "kv/range",
                json!({ "key": b64(start), "range_end": b64(end) }),
            )
            .await?;
        let mut out = Vec::new();
        if let Some(kvs) = rsp["kvs"].as_array() {
            for kv in kvs {
                out.push(KvPair {
                    key: un_b64(&kv["key"])?,
                    value: un_b64(&kv["value"])?,
                });
            }
        }
        Ok(out)
    }

    async fn dist_timed_lock(&self, ttl_secs: i64) -> Result<()> {
        let lease_id = self.lease_grant(ttl_secs.max(1)).await?;

        // Put-if-absent: succeeds only when the lock key has never been
        // created (or was deleted / lease-expired since).
        let rsp = self
            .call(
                "kv/txn",
                json!({
                    "compare": [{
                        "key": b64(&self.lock_key),
                        "target": "CREATE",
                        "create_revision": "0"
                    }],
                    "success": [{
                        "request_put": {
                            "key": b64(&self.lock_key),
                            "value": b64("held"),
                            "lease": lease_id.to_string()
                        }
                    }]
                }),
            )
            .await?;

        if rsp["succeeded"].as_bool().unwrap_or(false) {
            *self.lock.lock() = Some(HeldLock { lease_id });
            Ok(())
        } else {
            // Lost the race; don't leak the lease we granted.
            if let Err(e) = self.lease_revoke(lease_id).await {
                warn!("failed to revoke unused lock lease: {}", e);
            }
            Err(Error::LockContended)
        }
    }

    async fn dist_unlock(&self) -> Result<()> {
        let held = self.lock.lock().take();
        match held {
            Some(h) => {
                self.delete(&self.lock_key).await?;
                // The lease must not outlive the unlock.
                if let Err(e) = self.lease_revoke(h.lease_id).await {
                    debug!("lock lease revoke after unlock failed: {}", e);
                }
                Ok(())
            }
            None => Err(Error::Kv("unlock without a held lock".into())),
        }
    }

    async fn ephemeral_put(&self, key: &str) -> Result<()> {
        let lease_id = self.session_lease_id().await?;
        self.call(
            "kv/put",
            json!({
                "key": b64(key),
                "value": b64("alive"),
                "lease": lease_id.to_string()
            }),
        )
        .await?;
        Ok(())
    }

    async fn session_keepalive(&self) -> Result<()> {
        let lease_id = *self.session_lease.lock();
        if lease_id == 0 {
            return Ok(());
        }
        let rsp = self
            .call("lease/keepalive", json!({ "ID": lease_id.to_string() }))
            .await?;
        // A lapsed lease comes back with TTL 0; drop it so the next
        // ephemeral_put grants a fresh one.
        let ttl = parse_i64(&rsp["result"]["TTL"]).unwrap_or(0);
        if ttl <= 0 {
            warn!("session lease lapsed, ephemeral keys lost until re-put");
            *self.session_lease.lock() = 0;
        }
        Ok(())
    }
}
