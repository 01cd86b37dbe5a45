//! HTTP handlers.
//!
//! Handlers stay thin: validate, normalize, delegate to the ingest or
//! params core, and translate failures into problem details. All error
//! bodies are RFC 7807 with `about:blank` type and the request path as
//! the instance.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use hbmon_common::kv::etcd::KV_INIT_KEY;
use hbmon_common::{xname, ProblemDetails};

use crate::api::{URL_HB_STATE, URL_HB_STATES, URL_HEARTBEAT, URL_PARAMS};
use crate::ingest;
use crate::params::{self, Whence};
use crate::records::now_wall;
use crate::state::AppState;

// ════════════════════════════════════════════════════════════════════════════
// PAYLOADS
// ════════════════════════════════════════════════════════════════════════════

/// Full heartbeat message (unkeyed endpoint). Absent fields parse as
/// empty and are rejected by the required-field pass.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HbPayload {
    #[serde(rename = "Component")]
    component: String,
    #[serde(rename = "Hostname")]
    hostname: String,
    #[serde(rename = "NID")]
    nid: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
}

/// Keyed heartbeat message; the component comes from the path.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HbPathPayload {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct HbStatesReq {
    #[serde(rename = "XNames")]
    xnames: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HbStateRsp {
    #[serde(rename = "XName")]
    pub xname: String,
    #[serde(rename = "Heartbeating")]
    pub heartbeating: bool,
}

#[derive(Debug, Serialize)]
pub struct HbStatesRsp {
    #[serde(rename = "HBStates")]
    pub hb_states: Vec<HbStateRsp>,
}

#[derive(Debug, Serialize)]
pub struct HealthRsp {
    #[serde(rename = "KvStore")]
    pub kv_store: String,
    #[serde(rename = "MsgBus")]
    pub msg_bus: String,
    #[serde(rename = "HsmStatus")]
    pub hsm_status: String,
}

// ════════════════════════════════════════════════════════════════════════════
// VALIDATION HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// When a typed parse fails, re-parse untyped and name the first field
/// carrying a wrong type so the 400 body says something useful.
fn diagnose_fields(body: &[u8], fields: &[&str]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(v) => {
            for name in fields {
                if let Some(field) = v.get(*name) {
                    if !field.is_null() && !field.is_string() {
                        return format!("Invalid data type in {} field", name);
                    }
                }
            }
            "Invalid JSON data type".to_string()
        }
        Err(_) => "Invalid JSON data type".to_string(),
    }
}

/// NID strings historically allow base prefixes (0x...), so parse with
/// the loose integer grammar.
fn parse_nid(s: &str) -> Option<i64> {
    let t = s.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = t.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()
    } else {
        t.parse::<i64>().ok()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HEARTBEAT INGESTION
// ════════════════════════════════════════════════════════════════════════════

/// POST /hmi/v1/heartbeat
pub async fn hb_rcv(
    State(st): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ProblemDetails> {
    let errinst = URL_HEARTBEAT;

    let jdata = serde_json::from_slice::<HbPayload>(&body).map_err(|e| {
        warn!("Bad heartbeat JSON decode: {}", e);
        let detail = diagnose_fields(
            &body,
            &["Component", "Hostname", "NID", "Status", "Timestamp"],
        );
        ProblemDetails::bad_request(detail, errinst)
    })?;

    let missing = if jdata.component.is_empty() {
        Some("Component")
    } else if jdata.hostname.is_empty() {
        Some("Hostname")
    } else if jdata.nid.is_empty() {
        Some("NID")
    } else if jdata.status.is_empty() {
        Some("Status")
    } else if jdata.timestamp.is_empty() {
        Some("Timestamp")
    } else {
        None
    };
    if let Some(field) = missing {
        warn!("Incomplete heartbeat JSON: missing {} field", field);
        return Err(ProblemDetails::bad_request(
            format!("Missing {} field", field),
            errinst,
        ));
    }

    if !xname::is_valid(&jdata.component) {
        warn!("Invalid XName in heartbeat JSON: {}", jdata.component);
        return Err(ProblemDetails::bad_request("Invalid Component Name", errinst));
    }
    if parse_nid(&jdata.nid).is_none() {
        warn!("Invalid NID in heartbeat JSON: {}", jdata.nid);
        return Err(ProblemDetails::bad_request("Invalid NID", errinst));
    }

    let comp = xname::normalize(&jdata.component);
    ingest::upsert_heartbeat(&st, &comp, &jdata.status, &jdata.timestamp, errinst).await?;
    Ok(StatusCode::OK)
}

/// POST /hmi/v1/heartbeat/{xname}
pub async fn hb_rcv_xname(
    State(st): State<Arc<AppState>>,
    Path(raw_xname): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ProblemDetails> {
    let comp = xname::normalize(&raw_xname);
    let errinst = format!("{}/{}", URL_HEARTBEAT, comp);

    if !xname::is_valid(&comp) {
        warn!("Invalid XName in heartbeat URL: {}", comp);
        return Err(ProblemDetails::bad_request("Invalid Component Name", &errinst));
    }

    let jdata = serde_json::from_slice::<HbPathPayload>(&body).map_err(|e| {
        warn!("Bad heartbeat JSON decode: {}", e);
        let detail = diagnose_fields(&body, &["Status", "Timestamp"]);
        ProblemDetails::bad_request(detail, &errinst)
    })?;

    if jdata.status.is_empty() {
        return Err(ProblemDetails::bad_request("Missing Status field", &errinst));
    }
    if jdata.timestamp.is_empty() {
        return Err(ProblemDetails::bad_request("Missing Timestamp field", &errinst));
    }

    ingest::upsert_heartbeat(&st, &comp, &jdata.status, &jdata.timestamp, &errinst).await?;
    Ok(StatusCode::OK)
}

// ════════════════════════════════════════════════════════════════════════════
// PARAMETERS
// ════════════════════════════════════════════════════════════════════════════

/// GET /hmi/v1/params
pub async fn params_get(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let doc = params::to_doc(&st.params.read());
    Json(doc)
}

/// PATCH /hmi/v1/params
pub async fn params_patch(
    State(st): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ProblemDetails> {
    let errinst = URL_PARAMS;

    let doc = params::parse_doc(&body).map_err(|e| {
        warn!("Error parsing parameter JSON: '{}'", e);
        ProblemDetails::bad_request(e, errinst)
    })?;

    let cur = st.params.read().clone();
    let next = params::apply_doc(&doc, Whence::Patch, &cur).map_err(|e| {
        warn!("Error applying parameter PATCH: '{}'", e);
        ProblemDetails::bad_request(e, errinst)
    })?;

    // Persist to the shared KV key first; every replica syncs from it.
    params::store_to_kv(st.kv.as_ref(), &next).await.map_err(|e| {
        warn!("INTERNAL ERROR storing KV params value: {}", e);
        ProblemDetails::internal("Failed KV service STORE operation", errinst)
    })?;

    *st.params.write() = next;
    Ok(Json(params::to_doc(&st.params.read())))
}

// ════════════════════════════════════════════════════════════════════════════
// HEARTBEAT STATE QUERIES
// ════════════════════════════════════════════════════════════════════════════

/// POST /hmi/v1/hbstates
pub async fn hb_states(
    State(st): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<HbStatesRsp>, ProblemDetails> {
    let errinst = URL_HB_STATES;

    let jdata = serde_json::from_slice::<HbStatesReq>(&body).map_err(|e| {
        warn!("Error unmarshalling HB state req data: {}", e);
        ProblemDetails::bad_request("Error unmarshalling inbound request", errinst)
    })?;

    let now = now_wall();
    let mut rsp = HbStatesRsp { hb_states: Vec::with_capacity(jdata.xnames.len()) };
    for raw in &jdata.xnames {
        let comp = xname::normalize(raw);
        let heartbeating = ingest::is_heartbeating(&st, &comp, now, errinst).await?;
        rsp.hb_states.push(HbStateRsp { xname: comp, heartbeating });
    }
    Ok(Json(rsp))
}

/// GET /hmi/v1/hbstate/{xname}
pub async fn hb_state_single(
    State(st): State<Arc<AppState>>,
    Path(raw_xname): Path<String>,
) -> Result<Json<HbStateRsp>, ProblemDetails> {
    let comp = xname::normalize(&raw_xname);
    let errinst = format!("{}/{}", URL_HB_STATE, comp);
    let heartbeating = ingest::is_heartbeating(&st, &comp, now_wall(), &errinst).await?;
    Ok(Json(HbStateRsp { xname: comp, heartbeating }))
}

// ════════════════════════════════════════════════════════════════════════════
// PROBES
// ════════════════════════════════════════════════════════════════════════════

/// GET /hmi/v1/health, a human-oriented dependency summary.
pub async fn health(State(st): State<Arc<AppState>>) -> Json<HealthRsp> {
    let kv_store = match st.kv.get(KV_INIT_KEY).await {
        Err(e) => format!("Error accessing key values: {}", e),
        Ok(None) => "Initialization key not present".to_string(),
        Ok(Some(v)) => format!("Initialization key present: {}", v),
    };

    let msg_bus = if st.bus.is_connected().await {
        "Connected and OPEN".to_string()
    } else {
        "Not Connected".to_string()
    };

    let hsm_status = if st.params.read().nosm {
        "Disabled".to_string()
    } else if st.hsm_ready.load(Ordering::SeqCst) {
        "Ready".to_string()
    } else {
        "Not ready".to_string()
    };

    Json(HealthRsp { kv_store, msg_bus, hsm_status })
}

/// GET /hmi/v1/readiness, the k8s readiness probe: fail only when a restart
/// might help, which means the KV store path.
pub async fn readiness(State(st): State<Arc<AppState>>) -> StatusCode {
    match st.kv.get(KV_INIT_KEY).await {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!("readiness check: KV store error: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /hmi/v1/liveness: the server loop is alive.
pub async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

// ════════════════════════════════════════════════════════════════════════════
// METHOD FALLBACKS
// ════════════════════════════════════════════════════════════════════════════

pub async fn heartbeat_method_na(OriginalUri(uri): OriginalUri) -> ProblemDetails {
    ProblemDetails::method_not_allowed("POST", uri.path())
}

pub async fn params_method_na(OriginalUri(uri): OriginalUri) -> ProblemDetails {
    ProblemDetails::method_not_allowed("GET,PATCH", uri.path())
}

pub async fn hb_states_method_na(OriginalUri(uri): OriginalUri) -> ProblemDetails {
    ProblemDetails::method_not_allowed("POST", uri.path())
}

pub async fn hb_state_method_na(OriginalUri(uri): OriginalUri) -> ProblemDetails {
    ProblemDetails::method_not_allowed("GET", uri.path())
}

pub async fn get_only_method_na(OriginalUri(uri): OriginalUri) -> ProblemDetails {
    ProblemDetails::method_not_allowed("GET", uri.path())
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
