//! Liveness witness protocol.
//!
//! Each replica writes an ephemeral KV key for as long as it runs; the
//! key is bound to the replica's session and disappears when the
//! process dies. The presence of any witness key therefore proves at
//! least one replica has been watching the fleet recently.
//!
//! At startup, before writing its own key, a replica scans the witness
//! prefix. An empty scan means nobody was watching for a while: every
//! stored last-heartbeat time is stale and must not be read as node
//! death. The `stale_keys` condition makes the first scan downgrade
//! would-be death declarations to gap warnings (see the checker);
//! optionally (`clear_on_gap`) the whole heartbeat keyspace is dropped
//! instead and rediscovered from live traffic.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use hbmon_common::KvStore;

use crate::records::{HB_KEYRANGE_START, HB_KEYRANGE_END};
use crate::state::AppState;

/// Prefix for witness keys; the suffix is a random 31-bit integer.
pub const LIFE_KEY_PREFIX: &str = "hbmon_lifekey-";

/// Refresh period for the session backing the witness key. Must stay
/// well under the backend's session TTL.
const REFRESH_SECS: u64 = 3;

/// Generate this replica's witness key.
pub fn instance_key() -> String {
    let suffix: i32 = rand::thread_rng().gen_range(0..i32::MAX);
    format!("{}{}", LIFE_KEY_PREFIX, suffix)
}

/// Startup check: scan the witness prefix and report whether stored
/// heartbeat data must be considered stale. When stale and
/// `clear_on_gap` is set, delete every heartbeat record instead of
/// letting the checker re-warn them.
///
/// A scan failure is treated as "no witnesses": assuming the worst
/// means at most a spurious round of warnings, never a false fleet
/// death.
pub async fn check_life_keys(kv: &dyn KvStore, clear_on_gap: bool) -> bool {
    let start = format!("{}0", LIFE_KEY_PREFIX);
    let end = format!("{}{}", LIFE_KEY_PREFIX, i32::MAX);

    let stale = match kv.get_range(&start, &end).await {
        Ok(list) => {
            if list.is_empty() {
                info!("No life keys found, HB key cleanup set to: {}", clear_on_gap);
                true
            } else {
                false
            }
        }
        Err(e) => {
            error!("Can't retrieve life keys, assuming monitoring gap: {}", e);
            true
        }
    };

    if stale && clear_on_gap {
        match kv.get_range(HB_KEYRANGE_START, HB_KEYRANGE_END).await {
            Ok(hbkeys) => {
                for pair in hbkeys {
                    if let Err(e) = kv.delete(&pair.key).await {
                        error!("Problem trying to delete old HB key '{}': {}", pair.key, e);
                    }
                }
                info!("Old HB keys cleared");
            }
            Err(e) => error!("Trying to delete old HB keys, can't fetch any keys: {}", e),
        }
    }

    stale
}

/// Witness worker: writes this replica's ephemeral key (retrying
/// forever until the first success) and then keeps the backing session
/// alive. If the session ever lapses the key is re-put.
pub fn spawn_witness(st: Arc<AppState>, key: String, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut placed = false;
        loop {
            if !placed {
                match st.kv.ephemeral_put(&key).await {
                    Ok(()) => {
                        info!("Life key '{}' created", key);
                        placed = true;
                    }
                    Err(e) => warn!("Can't create life key '{}', retrying: {}", key, e),
                }
            } else if let Err(e) = st.kv.session_keepalive().await {
                warn!("Life key session refresh failed, will re-put: {}", e);
                placed = false;
            }

            tokio::select! {
                _ = shutdown.notified() => return,
                _ = sleep(Duration::from_secs(if placed { REFRESH_SECS } else { 2 })) => {}
            }
        }
    })
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use hbmon_common::kv::MemKv;
    use crate::records::HbRecord;

    #[test]
    fn test_instance_key_shape() {
        let k1 = instance_key();
        let k2 = instance_key();
        assert!(k1.starts_with(LIFE_KEY_PREFIX));
        let suffix: i32 = k1[LIFE_KEY_PREFIX.len()..].parse().unwrap();
        assert!(suffix >= 0);
        // Two draws colliding is astronomically unlikely; treat a
        // collision here as a real failure.
        assert_ne!(k1, k2);
    }

    #[tokio::test]
    async fn test_no_witnesses_means_stale() {
        let kv = MemKv::new();
        assert!(check_life_keys(&kv, false).await);
    }

    #[tokio::test]
    async fn test_existing_witness_means_fresh() {
        let kv = MemKv::new();
        kv.ephemeral_put(&format!("{}12345", LIFE_KEY_PREFIX)).await.unwrap();
        assert!(!check_life_keys(&kv, false).await);
    }

    #[tokio::test]
    async fn test_witness_from_died_replica_is_gone() {
        let kv = MemKv::new();
        kv.ephemeral_put(&format!("{}12345", LIFE_KEY_PREFIX)).await.unwrap();
        kv.drop_session();
        assert!(check_life_keys(&kv, false).await);
    }

    #[tokio::test]
    async fn test_clear_on_gap_drops_heartbeat_records() {
        let kv = MemKv::new();
        let rec = HbRecord::new("x0c0s0b0n0", 100, "t", "OK");
        kv.put("x0c0s0b0n0", &serde_json::to_string(&rec).unwrap()).await.unwrap();
        kv.put("params", "{}").await.unwrap();

        assert!(check_life_keys(&kv, true).await);
        assert!(kv.get("x0c0s0b0n0").await.unwrap().is_none());
        // Keys outside the heartbeat range survive.
        assert!(kv.get("params").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_failure_assumes_stale() {
        let kv = MemKv::new();
        kv.set_failing(true);
        assert!(check_life_keys(&kv, false).await);
    }
}
