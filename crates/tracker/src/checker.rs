//! The overdue checker.
//!
//! A one-shot timer that re-arms itself after every invocation. Each
//! firing tries to take the fleet-wide scan lock; losing it means
//! another replica is doing this scan, which is the normal state of
//! affairs in a multi-replica deployment, not an error.
//!
//! Holding the lock, the checker walks every heartbeat record, decides
//! a transition per record, batches the resulting write-backs and
//! deletes, and finally kicks the dispatch worker. The lock carries a
//! TTL of twice the scan interval so a replica that dies mid-scan
//! releases it automatically.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use hbmon_common::Error;

use crate::notify::Kind;
use crate::params;
use crate::records::{now_wall, HbRecord, WarnPhase, HB_KEYRANGE_START, HB_KEYRANGE_END};
use crate::state::AppState;
use crate::witness::LIFE_KEY_PREFIX;

/// One scan. Public so tests (and the timer worker) drive it directly.
pub async fn run_scan(st: &AppState) {
    // Pick up any parameter PATCH applied on another replica first, so
    // this scan runs with the fleet's current thresholds.
    params::sync_from_kv(st.kv.as_ref(), &st.params).await;

    let (warn_secs, err_secs, interval_secs, debug_level) = {
        let p = st.params.read();
        (p.warn_secs, p.err_secs, p.interval_secs, p.debug_level)
    };

    // Lock only in timed operation; tests run with the timer disabled
    // and drive scans single-threaded.
    let locked = if interval_secs > 0 {
        match st.kv.dist_timed_lock(interval_secs * 2).await {
            Ok(()) => true,
            Err(Error::LockContended) => {
                if debug_level > 1 {
                    debug!("HB checker being done elsewhere, skipping");
                }
                return;
            }
            Err(e) => {
                error!("ERROR acquiring distributed lock: {}", e);
                return;
            }
        }
    } else {
        false
    };

    let kvlist = match st.kv.get_range(HB_KEYRANGE_START, HB_KEYRANGE_END).await {
        Ok(list) => list,
        Err(e) => {
            error!("ERROR fetching heartbeat keys from KV store: {}", e);
            if locked {
                let _ = st.kv.dist_unlock().await;
            }
            return;
        }
    };

    let stale = st.stale_keys.load(Ordering::SeqCst);
    let mut ncomp: i64 = 0;
    let mut writebacks: Vec<HbRecord> = Vec::new();
    let mut deletes: Vec<String> = Vec::new();

    for kv in &kvlist {
        // Non-component keys that happen to share the range.
        if kv.key == params::KV_PARAM_KEY || kv.key.starts_with(LIFE_KEY_PREFIX) {
            continue;
        }

        if debug_level > 1 {
            debug!("Checking component: '{}'", kv.key);
        }

        let mut rec = match serde_json::from_str::<HbRecord>(&kv.value) {
            Ok(rec) => rec,
            Err(e) => {
                warn!("ERROR unmarshalling '{}': {}", kv.value, e);
                continue;
            }
        };

        ncomp += 1;

        // Current time per record, not per scan: range reads can stall
        // and the elapsed-time math has to stay honest.
        let now = now_wall();
        let tdiff = now - rec.rcv_wall();

        if tdiff >= err_secs {
            if stale {
                // A period with zero replicas running makes every
                // stored time stale; that is not evidence of death.
                // Re-warn, freshen the stamp, and let a future pass
                // decide from real data.
                warn!(
                    "Heartbeat overdue {} seconds for '{}' due to HB monitoring gap; might be dead, last status: '{}'",
                    tdiff, rec.component, rec.last_status
                );
                rec.set_rcv_wall(now);
                rec.warn_phase = WarnPhase::Gap;
                st.notifier.notify(&rec, Kind::StoppedWarn);
                writebacks.push(rec);
            } else {
                error!(
                    "Heartbeat overdue {} seconds for '{}' (declared dead), last status: '{}'",
                    tdiff, rec.component, rec.last_status
                );
                st.notifier.notify(&rec, Kind::StoppedError);
                deletes.push(kv.key.clone());
                ncomp -= 1;
            }
        } else if tdiff >= warn_secs {
            if rec.warn_phase == WarnPhase::None {
                warn!(
                    "Heartbeat overdue {} seconds for '{}' (might be dead), last status: '{}'",
                    tdiff, rec.component, rec.last_status
                );
                rec.warn_phase = WarnPhase::Normal;
                st.notifier.notify(&rec, Kind::StoppedWarn);
                writebacks.push(rec);
            }
        } else if rec.warn_phase == WarnPhase::Normal {
            // Back inside the window after a warning. A gap phase is
            // not restarted here; an incoming heartbeat clears it.
            info!("Heartbeat restarted for '{}'", rec.component);
            rec.warn_phase = WarnPhase::None;
            st.notifier.notify(&rec, Kind::RestartedWarn);
            writebacks.push(rec);
        }
    }

    for key in &deletes {
        if let Err(e) = st.kv.delete(key).await {
            error!("ERROR deleting key '{}' from KV store: {}", key, e);
        }
    }
    for rec in &writebacks {
        match serde_json::to_string(rec) {
            Ok(raw) => {
                if let Err(e) = st.kv.put(&rec.component, &raw).await {
                    error!("INTERNAL ERROR storing key '{}': {}", rec.component, e);
                }
            }
            Err(e) => error!("INTERNAL ERROR marshalling JSON for '{}': {}", rec.component, e),
        }
    }

    if locked {
        if let Err(e) = st.kv.dist_unlock().await {
            error!("ERROR unlocking distributed lock: {}", e);
        }
    }

    if st.live_count.swap(ncomp, Ordering::SeqCst) != ncomp {
        info!("Number of components heartbeating: {}", ncomp);
    }

    // One full scan has now run with the gap suppression in place;
    // stored times are trustworthy again.
    st.stale_keys.store(false, Ordering::SeqCst);

    st.kick_dispatch();
}

/// Timer worker. The timer is one-shot and re-armed after each scan,
/// so a slow scan cannot overlap itself. An interval of zero or less
/// disables scanning (used by tests) but the worker keeps watching the
/// parameter in case a PATCH turns it back on.
pub fn spawn_checker(st: Arc<AppState>, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = st.params.read().interval_secs;
            if interval <= 0 {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = sleep(Duration::from_secs(1)) => continue,
                }
            }

            tokio::select! {
                _ = shutdown.notified() => return,
                _ = sleep(Duration::from_secs(interval as u64)) => {}
            }

            run_scan(&st).await;
        }
    })
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::hex_wall;
    use crate::testutil::test_state;
    use hbmon_common::KvStore;

    async fn seed(kv: &hbmon_common::kv::MemKv, comp: &str, age_secs: i64, phase: WarnPhase) {
        let mut rec = HbRecord::new(comp, 0, "t0", "OK");
        rec.last_rcv_wall = hex_wall(now_wall() - age_secs);
        rec.warn_phase = phase;
        kv.put(comp, &serde_json::to_string(&rec).unwrap()).await.unwrap();
    }

    async fn load(kv: &hbmon_common::kv::MemKv, comp: &str) -> Option<HbRecord> {
        kv.get(comp)
            .await
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn thresholds(st: &AppState, warn: i64, err: i64) {
        let mut p = st.params.write();
        p.warn_secs = warn;
        p.err_secs = err;
        p.interval_secs = 0;
    }

    #[tokio::test]
    async fn test_fresh_record_is_noop() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 1, WarnPhase::None).await;

        run_scan(&st).await;

        let rec = load(&kv, "x0c0s0b0n0").await.unwrap();
        assert_eq!(rec.warn_phase, WarnPhase::None);
        assert_eq!(st.notifier.unmerged(Kind::StoppedWarn), 0);
    }

    #[tokio::test]
    async fn test_warn_window_emits_single_warning() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 7, WarnPhase::None).await;

        run_scan(&st).await;
        let rec = load(&kv, "x0c0s0b0n0").await.unwrap();
        assert_eq!(rec.warn_phase, WarnPhase::Normal);
        assert_eq!(st.notifier.unmerged(Kind::StoppedWarn), 1);

        // A second scan with the warning already recorded is a no-op.
        run_scan(&st).await;
        assert_eq!(st.notifier.unmerged(Kind::StoppedWarn), 1);
    }

    #[tokio::test]
    async fn test_error_window_deletes_record() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 25, WarnPhase::Normal).await;

        run_scan(&st).await;

        assert!(load(&kv, "x0c0s0b0n0").await.is_none());
        assert_eq!(st.notifier.unmerged(Kind::StoppedError), 1);
    }

    #[tokio::test]
    async fn test_restart_after_warning() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 1, WarnPhase::Normal).await;

        run_scan(&st).await;

        let rec = load(&kv, "x0c0s0b0n0").await.unwrap();
        assert_eq!(rec.warn_phase, WarnPhase::None);
        assert_eq!(st.notifier.unmerged(Kind::RestartedWarn), 1);
    }

    #[tokio::test]
    async fn test_gap_phase_not_restarted_by_checker() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 1, WarnPhase::Gap).await;

        run_scan(&st).await;

        let rec = load(&kv, "x0c0s0b0n0").await.unwrap();
        assert_eq!(rec.warn_phase, WarnPhase::Gap);
        assert_eq!(st.notifier.unmerged(Kind::RestartedWarn), 0);
    }

    #[tokio::test]
    async fn test_stale_keys_suppresses_death() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        st.stale_keys.store(true, Ordering::SeqCst);
        seed(&kv, "x0c0s0b0n0", 60, WarnPhase::None).await;

        run_scan(&st).await;

        // Re-warned and re-stamped, not deleted.
        let rec = load(&kv, "x0c0s0b0n0").await.unwrap();
        assert_eq!(rec.warn_phase, WarnPhase::Gap);
        assert!(now_wall() - rec.rcv_wall() < 2);
        assert_eq!(st.notifier.unmerged(Kind::StoppedError), 0);
        assert_eq!(st.notifier.unmerged(Kind::StoppedWarn), 1);

        // The flag clears after the scan; normal progression resumes.
        assert!(!st.stale_keys.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_non_component_keys_skipped() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        // The params record sorts outside x0..xz; a non-record key
        // inside the range must not break the scan.
        seed(&kv, "x0c0s0b0n0", 1, WarnPhase::None).await;
        kv.put("x0extra", "not json").await.unwrap();

        run_scan(&st).await;
        // The garbage key logs and is skipped; the scan completes.
        assert_eq!(st.live_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_count_tracks_scans() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        seed(&kv, "x0c0s0b0n0", 1, WarnPhase::None).await;
        seed(&kv, "x0c0s0b0n1", 1, WarnPhase::None).await;

        run_scan(&st).await;
        assert_eq!(st.live_count.load(Ordering::SeqCst), 2);

        seed(&kv, "x0c0s0b0n2", 25, WarnPhase::None).await;
        run_scan(&st).await;
        // The dead component is counted out as it is deleted.
        assert_eq!(st.live_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lock_contention_skips_scan() {
        let (st, kv, _) = test_state();
        {
            let mut p = st.params.write();
            p.warn_secs = 5;
            p.err_secs = 20;
            p.interval_secs = 5; // timed mode: lock is taken
        }
        seed(&kv, "x0c0s0b0n0", 25, WarnPhase::None).await;
        kv.dist_timed_lock(10).await.unwrap();

        run_scan(&st).await;

        // Another replica holds the lock; nothing happened here.
        assert!(load(&kv, "x0c0s0b0n0").await.is_some());
        assert_eq!(st.notifier.unmerged(Kind::StoppedError), 0);
    }

    #[tokio::test]
    async fn test_scan_picks_up_kv_params() {
        let (st, kv, _) = test_state();
        thresholds(&st, 5, 20);
        // Another replica PATCHed warn time down to 2 seconds.
        let mut fleet = st.params.read().clone();
        fleet.warn_secs = 2;
        fleet.err_secs = 20;
        params::store_to_kv(kv.as_ref(), &fleet).await.unwrap();

        seed(&kv, "x0c0s0b0n0", 3, WarnPhase::None).await;
        run_scan(&st).await;

        assert_eq!(st.params.read().warn_secs, 2);
        assert_eq!(st.notifier.unmerged(Kind::StoppedWarn), 1);
    }
}
