//! End-to-end scenarios over the in-memory KV store and a recording
//! state manager. Each test drives the real handler functions and scan
//! pipeline; only the network edges are fakes.
//!
//! Timing-sensitive scenarios do not sleep: they age a record by
//! rewriting its receive timestamp, the same trick the service's own
//! test tooling has always used.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use hbmon_common::kv::MemKv;
use hbmon_common::KvStore;

use hbmon_tracker::bus::EventBus;
use hbmon_tracker::checker::run_scan;
use hbmon_tracker::dispatch::dispatch_once;
use hbmon_tracker::handlers;
use hbmon_tracker::hsm::MockStateMgr;
use hbmon_tracker::notify::Kind;
use hbmon_tracker::params::{Params, ParamsHandle};
use hbmon_tracker::records::{hex_wall, now_wall, HbRecord, WarnPhase};
use hbmon_tracker::state::AppState;

const NODE: &str = "x1c2s2b0n3";

/// Scan interval 1 s equivalent (timer disabled, scans driven by the
/// test), warn after 5 s, dead after 20 s.
fn fixture() -> (Arc<AppState>, Arc<MemKv>, Arc<MockStateMgr>) {
    let kv = Arc::new(MemKv::new());
    let hsm = Arc::new(MockStateMgr::new());
    let mut p = Params::default();
    p.warn_secs = 5;
    p.err_secs = 20;
    p.interval_secs = 0;
    let params: ParamsHandle = Arc::new(RwLock::new(p));
    let (tx, _rx) = mpsc::channel(8);

    let st = AppState::new(
        params,
        kv.clone(),
        hsm.clone(),
        EventBus::new(),
        tx,
        "hbmon-test".to_string(),
    );
    st.hsm_ready.store(true, Ordering::SeqCst);
    (st, kv, hsm)
}

async fn post_heartbeat(st: &Arc<AppState>, comp: &str) {
    let body = format!(
        r#"{{"Component":"{}","Hostname":"n1","NID":"1","Status":"OK","Timestamp":"T0"}}"#,
        comp
    );
    let code = handlers::hb_rcv(State(st.clone()), Bytes::from(body))
        .await
        .expect("heartbeat POST should succeed");
    assert_eq!(code, axum::http::StatusCode::OK);
}

/// Rewrite a stored record so its last receive time is `age` seconds
/// in the past.
async fn age_record(kv: &MemKv, comp: &str, age: i64) {
    let raw = kv.get(comp).await.unwrap().expect("record must exist");
    let mut rec: HbRecord = serde_json::from_str(&raw).unwrap();
    rec.last_rcv_wall = hex_wall(now_wall() - age);
    kv.put(comp, &serde_json::to_string(&rec).unwrap()).await.unwrap();
}

async fn heartbeating(st: &Arc<AppState>, comp: &str) -> bool {
    let rsp = handlers::hb_state_single(State(st.clone()), Path(comp.to_string()))
        .await
        .expect("hbstate lookup should succeed");
    assert_eq!(rsp.0.xname, comp);
    rsp.0.heartbeating
}

// ════════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_happy_heartbeat() {
    let (st, _kv, hsm) = fixture();

    post_heartbeat(&st, NODE).await;
    assert!(heartbeating(&st, NODE).await);

    dispatch_once(&st).await;
    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].state, "Ready");
    assert_eq!(accepted[0].flag, "OK");
    assert_eq!(accepted[0].component_ids, vec![NODE.to_string()]);
    assert_eq!(accepted[0].extended_info.message, "Heartbeat started");
}

#[tokio::test]
async fn scenario_warn_then_restart() {
    let (st, kv, hsm) = fixture();

    post_heartbeat(&st, NODE).await;
    dispatch_once(&st).await;
    hsm.clear_accepted();

    // 7 seconds of silence: warning window.
    age_record(&kv, NODE, 7).await;
    run_scan(&st).await;
    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].state, "Ready");
    assert_eq!(accepted[0].flag, "Warning");
    assert_eq!(accepted[0].component_ids, vec![NODE.to_string()]);

    // "Might be dead" still counts as heartbeating.
    assert!(heartbeating(&st, NODE).await);
    hsm.clear_accepted();

    // The node speaks again; the next scan reports the restart.
    post_heartbeat(&st, NODE).await;
    run_scan(&st).await;
    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].flag, "OK");
    assert_eq!(accepted[0].extended_info.message, "Heartbeat restarted");
}

#[tokio::test]
async fn scenario_declared_dead() {
    let (st, kv, hsm) = fixture();

    post_heartbeat(&st, NODE).await;
    dispatch_once(&st).await;
    hsm.clear_accepted();

    age_record(&kv, NODE, 25).await;
    run_scan(&st).await;
    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].state, "Standby");
    assert_eq!(accepted[0].flag, "Alert");

    // Record deleted; the component no longer reads as heartbeating.
    assert!(kv.get(NODE).await.unwrap().is_none());
    assert!(!heartbeating(&st, NODE).await);
}

#[tokio::test]
async fn scenario_monitoring_gap_suppression() {
    let (st, kv, hsm) = fixture();

    // Pre-populate a record 60 seconds stale, as if left over from
    // before a total outage, and mark the gap condition.
    let mut rec = HbRecord::new(NODE, 0, "T0", "OK");
    rec.last_rcv_wall = hex_wall(now_wall() - 60);
    kv.put(NODE, &serde_json::to_string(&rec).unwrap()).await.unwrap();
    st.stale_keys.store(true, Ordering::SeqCst);

    run_scan(&st).await;
    dispatch_once(&st).await;

    // Warning, not Alert; record re-stamped, not deleted.
    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].flag, "Warning");

    let raw = kv.get(NODE).await.unwrap().expect("record must survive the gap");
    let rec: HbRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(rec.warn_phase, WarnPhase::Gap);
    assert!(now_wall() - rec.rcv_wall() < 2);

    // Second scan with no intervening heartbeat: the freshened stamp
    // means normal warn/error progression resumes, and right now the
    // record is simply in the live window.
    hsm.clear_accepted();
    run_scan(&st).await;
    dispatch_once(&st).await;
    assert!(hsm.accepted().is_empty());
    assert!(kv.get(NODE).await.unwrap().is_some());
}

#[tokio::test]
async fn scenario_last_transition_wins() {
    let (st, _kv, hsm) = fixture();
    let rec = HbRecord::new(NODE, 100, "T0", "OK");

    st.notifier.notify(&rec, Kind::Started);
    st.notifier.notify(&rec, Kind::StoppedWarn);
    st.notifier.notify(&rec, Kind::StoppedError);
    st.notifier.notify(&rec, Kind::Started);

    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1, "only the winning batch may carry the component");
    assert_eq!(accepted[0].flag, "OK");
    assert_eq!(accepted[0].extended_info.message, "Heartbeat started");
    assert_eq!(accepted[0].component_ids, vec![NODE.to_string()]);
}

#[tokio::test]
async fn scenario_hsm_retry_across_scans() {
    let (st, kv, hsm) = fixture();
    hsm.set_status(500);

    post_heartbeat(&st, NODE).await;
    age_record(&kv, NODE, 7).await;
    run_scan(&st).await;

    // Three dispatch cycles against a broken HSM: nothing lands,
    // everything is retained.
    dispatch_once(&st).await;
    dispatch_once(&st).await;
    dispatch_once(&st).await;
    assert!(hsm.accepted().is_empty());
    assert!(st.notifier.pending(Kind::Started) + st.notifier.pending(Kind::StoppedWarn) > 0);

    // HSM recovers; the accumulated transitions go out, one batch per
    // kind that has content. The warning superseded the start for this
    // component, so exactly one batch carries it.
    hsm.set_status(200);
    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].flag, "Warning");
    assert_eq!(st.notifier.pending(Kind::Started), 0);
    assert_eq!(st.notifier.pending(Kind::StoppedWarn), 0);
}

// ════════════════════════════════════════════════════════════════════════════
// PROPERTY-SHAPED CHECKS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn repeated_heartbeats_produce_one_started() {
    let (st, _kv, hsm) = fixture();
    for _ in 0..5 {
        post_heartbeat(&st, NODE).await;
    }
    dispatch_once(&st).await;

    let accepted = hsm.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].component_ids, vec![NODE.to_string()]);
}

#[tokio::test]
async fn gap_scan_never_declares_death() {
    let (st, kv, _hsm) = fixture();
    st.stale_keys.store(true, Ordering::SeqCst);

    // Several components, all absurdly overdue.
    for i in 0..4 {
        let comp = format!("x0c0s0b0n{}", i);
        let mut rec = HbRecord::new(&comp, 0, "T0", "OK");
        rec.last_rcv_wall = hex_wall(now_wall() - 3600);
        kv.put(&comp, &serde_json::to_string(&rec).unwrap()).await.unwrap();
    }

    run_scan(&st).await;

    st.notifier.merge();
    let payloads = st.notifier.build_payloads();
    let errors = payloads.iter().find(|p| p.kind == Kind::StoppedError).unwrap();
    assert!(!errors.need_send, "a gap scan must not declare anything dead");
    for i in 0..4 {
        assert!(kv.get(&format!("x0c0s0b0n{}", i)).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn unchanged_component_emits_at_most_one_transition_per_scan() {
    let (st, kv, _hsm) = fixture();

    post_heartbeat(&st, NODE).await;
    age_record(&kv, NODE, 7).await;

    // Two scans over the same unchanged overdue record: exactly one
    // warning in total.
    run_scan(&st).await;
    run_scan(&st).await;

    st.notifier.merge();
    let payloads = st.notifier.build_payloads();
    let warns = payloads.iter().find(|p| p.kind == Kind::StoppedWarn).unwrap();
    assert_eq!(warns.ids, vec![NODE.to_string()]);
}

#[tokio::test]
async fn params_patch_roundtrip() {
    let (st, _kv, _hsm) = fixture();

    let body = Bytes::from(r#"{"Warntime":"6","Errtime":"18","Use_telemetry":"no"}"#);
    handlers::params_patch(State(st.clone()), body)
        .await
        .expect("PATCH should apply");

    assert_eq!(st.params.read().warn_secs, 6);
    assert_eq!(st.params.read().err_secs, 18);
    assert!(!st.params.read().use_telemetry);

    // GET returns the patched values merged over the prior state.
    let doc = hbmon_tracker::params::to_doc(&st.params.read());
    assert_eq!(doc.warntime, "6");
    assert_eq!(doc.errtime, "18");
    assert_eq!(doc.interval, "0");
}

#[tokio::test]
async fn params_patch_rejects_port_and_bad_fields_atomically() {
    let (st, _kv, _hsm) = fixture();

    let body = Bytes::from(r#"{"Warntime":"6","Port":"9999"}"#);
    let err = handlers::params_patch(State(st.clone()), body)
        .await
        .err()
        .expect("port PATCH must be rejected");
    assert_eq!(err.status, 400);

    // Atomicity: the valid field in the rejected document did not land.
    assert_eq!(st.params.read().warn_secs, 5);
}

#[tokio::test]
async fn invalid_heartbeats_are_rejected() {
    let (st, _kv, _hsm) = fixture();

    // Missing field.
    let body = Bytes::from(r#"{"Component":"x1c2s2b0n3","Hostname":"n1","NID":"1","Status":"OK"}"#);
    let err = handlers::hb_rcv(State(st.clone()), body).await.err().unwrap();
    assert_eq!(err.status, 400);
    assert_eq!(err.detail, "Missing Timestamp field");

    // Bad component name.
    let body = Bytes::from(r#"{"Component":"fred","Hostname":"n1","NID":"1","Status":"OK","Timestamp":"T0"}"#);
    let err = handlers::hb_rcv(State(st.clone()), body).await.err().unwrap();
    assert_eq!(err.detail, "Invalid Component Name");

    // Non-integer NID.
    let body = Bytes::from(r#"{"Component":"x1c2s2b0n3","Hostname":"n1","NID":"one","Status":"OK","Timestamp":"T0"}"#);
    let err = handlers::hb_rcv(State(st.clone()), body).await.err().unwrap();
    assert_eq!(err.detail, "Invalid NID");

    // Wrong field type is named in the diagnosis.
    let body = Bytes::from(r#"{"Component":"x1c2s2b0n3","Hostname":"n1","NID":1,"Status":"OK","Timestamp":"T0"}"#);
    let err = handlers::hb_rcv(State(st.clone()), body).await.err().unwrap();
    assert_eq!(err.detail, "Invalid data type in NID field");
}

#[tokio::test]
async fn keyed_and_body_endpoints_converge() {
    let (st, kv, _hsm) = fixture();

    post_heartbeat(&st, NODE).await;

    // The keyed form, uppercased, lands on the same record.
    let body = Bytes::from(r#"{"Status":"DEGRADED","Timestamp":"T1"}"#);
    handlers::hb_rcv_xname(State(st.clone()), Path(NODE.to_uppercase()), body)
        .await
        .expect("keyed heartbeat should succeed");

    let raw = kv.get(NODE).await.unwrap().unwrap();
    let rec: HbRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(rec.last_status, "DEGRADED");
    assert_eq!(rec.last_sender_ts, "T1");

    // Still exactly one started transition.
    st.notifier.merge();
    let payloads = st.notifier.build_payloads();
    let started = payloads.iter().find(|p| p.kind == Kind::Started).unwrap();
    assert_eq!(started.ids.len(), 1);
}

#[tokio::test]
async fn hbstates_bulk_query() {
    let (st, kv, _hsm) = fixture();

    post_heartbeat(&st, NODE).await;
    let mut dead = HbRecord::new("x2c0s0b0n0", 0, "T0", "OK");
    dead.last_rcv_wall = hex_wall(now_wall() - 120);
    kv.put("x2c0s0b0n0", &serde_json::to_string(&dead).unwrap()).await.unwrap();

    let body = Bytes::from(format!(
        r#"{{"XNames":["{}","x2c0s0b0n0","x9c9s9b9n9"]}}"#,
        NODE.to_uppercase()
    ));
    let rsp = handlers::hb_states(State(st.clone()), body).await.unwrap();

    let states = &rsp.0.hb_states;
    assert_eq!(states.len(), 3);
    assert_eq!(states[0].xname, NODE);
    assert!(states[0].heartbeating);
    assert!(!states[1].heartbeating);
    assert!(!states[2].heartbeating);
}
