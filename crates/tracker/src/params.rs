//! Runtime-tunable operating parameters.
//!
//! One parameter record is shared by every replica through a single KV
//! key: a PATCH applied on any replica is stored there and re-read by
//! the others at the start of each scan. The wire document keeps the
//! historical all-strings JSON shape so older tooling can still GET and
//! PATCH it.
//!
//! Precedence at startup: command line > environment > built-in
//! defaults; a parameter record already in the KV store overrides all
//! of those (it reflects the fleet's last PATCH).

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use hbmon_common::{KvStore, Result};

/// KV key holding the shared parameter record.
pub const KV_PARAM_KEY: &str = "params";

/// Default listen port. Startup-only; PATCH rejects it.
pub const DEFAULT_PORT: u16 = 28500;

const DEFAULT_SM_URL: &str = "http://localhost:27779/hsm/v2";

// ════════════════════════════════════════════════════════════════════════════
// TYPED PARAMETERS
// ════════════════════════════════════════════════════════════════════════════

/// The in-process, typed view of the parameter record.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    /// Extra logging detail; 0 = quiet, 1 = per-event, 2 = per-component.
    pub debug_level: i64,
    /// Suppress all state-manager traffic (test/bring-up mode).
    pub nosm: bool,
    /// Publish change notifications onto the event bus.
    pub use_telemetry: bool,
    /// `host:port:topic` of the event bus, empty when unset.
    pub telemetry_host: String,
    /// Seconds without a heartbeat before a warning is emitted.
    pub warn_secs: i64,
    /// Seconds without a heartbeat before a component is declared dead.
    pub err_secs: i64,
    /// HTTP listen port (startup-only).
    pub port: u16,
    /// KV store base URL (effective at startup).
    pub kv_url: String,
    /// Seconds between overdue-check scans; <= 0 disables the timer.
    pub interval_secs: i64,
    /// State manager base URL.
    pub sm_url: String,
    /// Per-request state manager deadline, seconds.
    pub sm_timeout_secs: i64,
    /// State manager not-found retry budget.
    pub sm_retries: i64,
    /// After a monitoring gap, delete all stored heartbeat records
    /// instead of re-warning them.
    pub clear_on_gap: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            debug_level: 0,
            nosm: false,
            use_telemetry: true,
            telemetry_host: String::new(),
            warn_secs: 10,
            err_secs: 30,
            port: DEFAULT_PORT,
            kv_url: String::new(),
            interval_secs: 5,
            sm_url: DEFAULT_SM_URL.to_string(),
            sm_timeout_secs: 10,
            sm_retries: 3,
            clear_on_gap: false,
        }
    }
}

/// Shared handle; read by every worker, written by PATCH and KV sync.
pub type ParamsHandle = Arc<RwLock<Params>>;

/// Where a parameter document came from, which controls what it may
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Startup file/flags; everything settable.
    Start,
    /// Runtime PATCH; `Port` is rejected.
    Patch,
    /// Replica sync from the KV record; everything settable, errors
    /// logged not surfaced.
    Sync,
}

// ════════════════════════════════════════════════════════════════════════════
// WIRE DOCUMENT
// ════════════════════════════════════════════════════════════════════════════

/// The all-strings JSON parameter document. An empty string means "not
/// present" in a PATCH; GET always returns every field populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParamsDoc {
    #[serde(rename = "Debug")]
    pub debug: String,
    #[serde(rename = "Nosm")]
    pub nosm: String,
    #[serde(rename = "Use_telemetry")]
    pub use_telemetry: String,
    #[serde(rename = "Telemetry_host")]
    pub telemetry_host: String,
    #[serde(rename = "Warntime")]
    pub warntime: String,
    #[serde(rename = "Errtime")]
    pub errtime: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "Kv_url")]
    pub kv_url: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Sm_url")]
    pub sm_url: String,
    #[serde(rename = "Sm_timeout")]
    pub sm_timeout: String,
    #[serde(rename = "Sm_retries")]
    pub sm_retries: String,
    #[serde(rename = "Clear_on_gap")]
    pub clear_on_gap: String,
}

/// Field names in document order, for the untyped-fallback diagnosis.
const DOC_FIELDS: [&str; 13] = [
    "Debug",
    "Nosm",
    "Use_telemetry",
    "Telemetry_host",
    "Warntime",
    "Errtime",
    "Port",
    "Kv_url",
    "Interval",
    "Sm_url",
    "Sm_timeout",
    "Sm_retries",
    "Clear_on_gap",
];

/// Render the current parameters as the wire document.
pub fn to_doc(p: &Params) -> ParamsDoc {
    ParamsDoc {
        debug: p.debug_level.to_string(),
        nosm: bool_str(p.nosm),
        use_telemetry: bool_str(p.use_telemetry),
        telemetry_host: p.telemetry_host.clone(),
        warntime: p.warn_secs.to_string(),
        errtime: p.err_secs.to_string(),
        port: p.port.to_string(),
        kv_url: p.kv_url.clone(),
        interval: p.interval_secs.to_string(),
        sm_url: p.sm_url.clone(),
        sm_timeout: p.sm_timeout_secs.to_string(),
        sm_retries: p.sm_retries.to_string(),
        clear_on_gap: bool_str(p.clear_on_gap),
    }
}

fn bool_str(b: bool) -> String {
    if b { "1".to_string() } else { "0".to_string() }
}

/// Parse a request body into a document. On a typed-parse failure,
/// re-parse as an untyped map and report which field carries the wrong
/// type, so the caller gets a useful problem-details body.
pub fn parse_doc(body: &[u8]) -> std::result::Result<ParamsDoc, String> {
    match serde_json::from_slice::<ParamsDoc>(body) {
        Ok(doc) => Ok(doc),
        Err(_) => {
            let v: Value = match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(_) => return Err("Invalid JSON data type".to_string()),
            };
            for name in DOC_FIELDS {
                if let Some(field) = v.get(name) {
                    if !field.is_null() && !field.is_string() {
                        return Err(format!("Invalid data type in {} field", name));
                    }
                }
            }
            Err("Invalid JSON data type".to_string())
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// APPLICATION
// ════════════════════════════════════════════════════════════════════════════

/// Apply a (possibly partial) document over current parameters.
/// All-or-nothing: any bad field rejects the whole document and the
/// accumulated error text is returned.
pub fn apply_doc(
    doc: &ParamsDoc,
    whence: Whence,
    cur: &Params,
) -> std::result::Result<Params, String> {
    let mut next = cur.clone();
    let mut errs = String::new();

    set_uint(&doc.debug, "debug", &mut next.debug_level, &mut errs);
    set_bool(&doc.nosm, "nosm", &mut next.nosm, &mut errs);
    set_bool(&doc.use_telemetry, "use_telemetry", &mut next.use_telemetry, &mut errs);

    if !doc.telemetry_host.is_empty() {
        match parse_telemetry_host(&doc.telemetry_host) {
            Ok(_) => next.telemetry_host = doc.telemetry_host.clone(),
            Err(_) => {
                errs.push_str(&format!(
                    "Parameter 'telemetry_host' with invalid format '{}'; ",
                    doc.telemetry_host
                ));
            }
        }
    }

    set_uint(&doc.warntime, "warntime", &mut next.warn_secs, &mut errs);
    set_uint(&doc.errtime, "errtime", &mut next.err_secs, &mut errs);
    set_uint(&doc.interval, "interval", &mut next.interval_secs, &mut errs);

    if !doc.port.is_empty() {
        if whence == Whence::Patch {
            errs.push_str("Parameter 'port' can't be changed in PATCH operation; ");
        } else {
            match doc.port.parse::<u16>() {
                Ok(p) => next.port = p,
                Err(_) => {
                    errs.push_str(&format!(
                        "Parameter 'port' with illegal value '{}'; ",
                        doc.port
                    ));
                }
            }
        }
    }

    if !doc.kv_url.is_empty() {
        next.kv_url = doc.kv_url.clone();
    }
    if !doc.sm_url.is_empty() {
        next.sm_url = doc.sm_url.clone();
    }

    set_uint(&doc.sm_timeout, "sm_timeout", &mut next.sm_timeout_secs, &mut errs);
    set_uint(&doc.sm_retries, "sm_retries", &mut next.sm_retries, &mut errs);
    set_bool(&doc.clear_on_gap, "clear_on_gap", &mut next.clear_on_gap, &mut errs);

    if errs.is_empty() {
        Ok(next)
    } else {
        Err(errs.trim_end().to_string())
    }
}

fn set_uint(field: &str, name: &str, target: &mut i64, errs: &mut String) {
    if field.is_empty() {
        return;
    }
    match field.parse::<u32>() {
        Ok(v) => *target = i64::from(v),
        Err(_) => {
            errs.push_str(&format!(
                "Parameter '{}' with illegal value '{}'; ",
                name, field
            ));
        }
    }
}

fn set_bool(field: &str, name: &str, target: &mut bool, errs: &mut String) {
    if field.is_empty() {
        return;
    }
    match parse_bool(field) {
        Some(v) => *target = v,
        None => {
            errs.push_str(&format!(
                "Parameter '{}' with unknown value '{}'; ",
                name, field
            ));
        }
    }
}

/// Accepted boolean spellings, case-insensitive.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "0" | "no" | "off" | "false" => Some(false),
        "1" | "yes" | "on" | "true" => Some(true),
        _ => None,
    }
}

/// Parse a `host:port:topic` event bus specification.
pub fn parse_telemetry_host(spec: &str) -> std::result::Result<(String, u16, String), String> {
    let toks: Vec<&str> = spec.split(':').collect();
    if toks.len() != 3 {
        return Err(format!(
            "Invalid telemetry host specification '{}', should be host:port:topic format",
            spec
        ));
    }
    let port = toks[1]
        .parse::<u16>()
        .map_err(|_| format!("Invalid port specification '{}', must be numeric", toks[1]))?;
    Ok((toks[0].to_string(), port, toks[2].to_string()))
}

// ════════════════════════════════════════════════════════════════════════════
// KV PERSISTENCE
// ════════════════════════════════════════════════════════════════════════════

/// Store the current parameters under the shared KV key.
pub async fn store_to_kv(kv: &dyn KvStore, p: &Params) -> Result<()> {
    let doc = serde_json::to_string(&to_doc(p))?;
    kv.put(KV_PARAM_KEY, &doc).await
}

/// Pull the shared parameter record and apply it over the local view.
/// Missing record and transient KV failures are quiet; a record we
/// cannot parse is logged loudly because we wrote it ourselves.
pub async fn sync_from_kv(kv: &dyn KvStore, handle: &ParamsHandle) {
    let raw = match kv.get(KV_PARAM_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(e) => {
            debug!("params KV sync skipped: {}", e);
            return;
        }
    };

    let doc = match serde_json::from_str::<ParamsDoc>(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("INTERNAL ERROR unmarshalling KV params record: {}", e);
            return;
        }
    };

    let cur = handle.read().clone();
    match apply_doc(&doc, Whence::Sync, &cur) {
        Ok(next) => {
            if next != cur {
                debug!("params updated from KV record");
                *handle.write() = next;
            }
        }
        Err(e) => warn!("KV params record rejected: {}", e),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
