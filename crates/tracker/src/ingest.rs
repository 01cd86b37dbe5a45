//! Heartbeat ingestion.
//!
//! The hot path. A heartbeat POST costs one KV get, one KV put, and
//! (for a first-ever heartbeat) one aggregator insert plus a
//! non-blocking bus offer. It never touches the distributed lock and
//! never waits on the state manager.

use tracing::{debug, info, warn};

use hbmon_common::ProblemDetails;

use crate::notify::Kind;
use crate::records::{now_wall, HbRecord, WarnPhase};
use crate::state::AppState;

/// Upsert a heartbeat for an already-normalized, validated component.
///
/// Protocol:
/// 1. fetch the record; absent means first-ever heartbeat
/// 2. stamp receive time, sender timestamp, status
/// 3. demote a gap warning to a normal warning: the node has spoken,
///    so the synthetic gap state can progress like an ordinary warning
/// 4. write back
/// 5. first-ever heartbeat emits a `started` transition
pub async fn upsert_heartbeat(
    st: &AppState,
    component: &str,
    status: &str,
    timestamp: &str,
    errinst: &str,
) -> Result<(), ProblemDetails> {
    if st.params.read().debug_level > 0 {
        debug!(
            "Heartbeat: component: {}, status: {}, time: {}",
            component, status, timestamp
        );
    }

    let existing = st.kv.get(component).await.map_err(|e| {
        warn!("ERROR retrieving heartbeat record for '{}': {}", component, e);
        ProblemDetails::internal("Key/Value service GET operation failed", errinst)
    })?;

    let now = now_wall();
    let (mut rec, new) = match existing {
        None => (HbRecord::new(component, now, timestamp, status), true),
        Some(raw) => match serde_json::from_str::<HbRecord>(&raw) {
            Ok(rec) => (rec, false),
            Err(e) => {
                warn!("INTERNAL ERROR unmarshalling '{}': {}", raw, e);
                return Err(ProblemDetails::internal(
                    "Error unmarshalling JSON string",
                    errinst,
                ));
            }
        },
    };

    rec.set_rcv_wall(now);
    rec.last_sender_ts = timestamp.to_string();
    rec.last_status = status.to_string();

    if rec.warn_phase == WarnPhase::Gap {
        rec.warn_phase = WarnPhase::Normal;
    }

    let raw = serde_json::to_string(&rec).map_err(|e| {
        warn!("INTERNAL ERROR marshalling JSON: {}", e);
        ProblemDetails::internal("Error marshalling JSON data", errinst)
    })?;

    st.kv.put(component, &raw).await.map_err(|e| {
        warn!("INTERNAL ERROR storing key '{}': {}", component, e);
        ProblemDetails::internal("Key/Value service store operation failed", errinst)
    })?;

    if new {
        info!("Heartbeat started for '{}'", component);
        st.notifier.notify(&rec, Kind::Started);
    }

    Ok(())
}

/// Whether a component counts as heartbeating right now: a record
/// exists and its receive time is inside the error window. A component
/// in the warning window ("might be dead") still counts as
/// heartbeating.
pub async fn is_heartbeating(
    st: &AppState,
    component: &str,
    now: i64,
    errinst: &str,
) -> Result<bool, ProblemDetails> {
    let raw = match st.kv.get(component).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(false),
        Err(e) => {
            warn!("ERROR retrieving key '{}': {}", component, e);
            return Err(ProblemDetails::internal(
                format!("Error retrieving key '{}'", component),
                errinst,
            ));
        }
    };

    let rec = serde_json::from_str::<HbRecord>(&raw).map_err(|e| {
        warn!("INTERNAL ERROR unmarshalling '{}': {}", raw, e);
        ProblemDetails::internal(
            format!("Error unmarshalling JSON for key '{}'", component),
            errinst,
        )
    })?;

    let err_secs = st.params.read().err_secs;
    Ok(now - rec.rcv_wall() < err_secs)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
