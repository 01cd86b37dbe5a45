//! Heartbeat record storage types.
//!
//! One record per tracked component lives in the KV store under
//! key = component xname. The wire format (PascalCase field names,
//! hex-encoded receive time, two-letter warning phase codes) is kept
//! compatible with earlier generations of the tracker so a rolling
//! upgrade can read records written by the previous release.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Heartbeat records all key under component xnames, which sort inside
/// this range.
pub const HB_KEYRANGE_START: &str = "x0";
pub const HB_KEYRANGE_END: &str = "xz";

// ════════════════════════════════════════════════════════════════════════════
// WARN PHASE
// ════════════════════════════════════════════════════════════════════════════

/// Per-record warning state machine.
///
/// - `None`: heartbeating normally, no outstanding warning
/// - `Normal`: a stopped-warning was emitted for the current gap
/// - `Gap`: a warning was synthesized because the record was stale
///   after a monitoring gap; cleared by the next incoming heartbeat
///   (demoted to `Normal`), never by the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WarnPhase {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "WN")]
    Normal,
    #[serde(rename = "WG")]
    Gap,
}

// ════════════════════════════════════════════════════════════════════════════
// HEARTBEAT RECORD
// ════════════════════════════════════════════════════════════════════════════

/// One tracked component's heartbeat state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HbRecord {
    /// Component xname; equals the KV key.
    #[serde(rename = "Component")]
    pub component: String,

    /// Wall-clock seconds when the last heartbeat was accepted by any
    /// replica, hex-encoded.
    #[serde(rename = "Last_hb_rcv_time")]
    pub last_rcv_wall: String,

    /// Opaque timestamp string supplied by the sender, echoed in
    /// notifications.
    #[serde(rename = "Last_hb_timestamp")]
    pub last_sender_ts: String,

    /// Opaque status string from the sender.
    #[serde(rename = "Last_hb_status")]
    pub last_status: String,

    /// Warning state machine phase.
    #[serde(rename = "Had_warning", default)]
    pub warn_phase: WarnPhase,
}

impl HbRecord {
    /// Fresh record for a component's first-ever heartbeat.
    pub fn new(component: &str, now: i64, sender_ts: &str, status: &str) -> Self {
        Self {
            component: component.to_string(),
            last_rcv_wall: hex_wall(now),
            last_sender_ts: sender_ts.to_string(),
            last_status: status.to_string(),
            warn_phase: WarnPhase::None,
        }
    }

    /// Decode the hex receive time. Records we wrote ourselves always
    /// decode; garbage maps to 0 which reads as "very overdue", the
    /// safe direction.
    pub fn rcv_wall(&self) -> i64 {
        i64::from_str_radix(&self.last_rcv_wall, 16).unwrap_or(0)
    }

    /// Re-stamp the receive time.
    pub fn set_rcv_wall(&mut self, now: i64) {
        self.last_rcv_wall = hex_wall(now);
    }
}

/// Hex-encode a wall-clock seconds value the way records store it.
pub fn hex_wall(now: i64) -> String {
    format!("{:x}", now.max(0))
}

/// Current wall-clock time in whole seconds.
pub fn now_wall() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
