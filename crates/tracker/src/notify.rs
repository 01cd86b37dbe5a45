//! Transition notification and aggregation.
//!
//! Every heartbeat state transition observed by ingestion or the
//! overdue checker flows through [`Notifier::notify`]. Each transition
//! gets the next value of a per-replica monotonic sequence counter and
//! lands in the *global* map for its kind; the same call offers a bus
//! notification, non-blocking.
//!
//! After each scan the dispatcher merges the global maps into the
//! *persistent* maps and builds one bulk payload per kind. The
//! persistent maps survive failed sends: a kind whose PATCH did not
//! reach the state manager keeps its entries and they ride along on
//! the next scan, merged with whatever arrived since.
//!
//! A component that flapped through several transitions within one
//! cycle appears in more than one map; the payload it joins is decided
//! by the highest sequence number, so only its latest state is
//! reported. Sequence numbers (not timestamps) make that resolution
//! clock-independent: they are unique, so ties cannot occur.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{BusMessage, EventBus, BUS_MESSAGE_ID};
use crate::records::HbRecord;

// ════════════════════════════════════════════════════════════════════════════
// TRANSITION KINDS
// ════════════════════════════════════════════════════════════════════════════

/// The four heartbeat transition kinds, with their fixed state-manager
/// projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Started,
    RestartedWarn,
    StoppedWarn,
    StoppedError,
}

impl Kind {
    pub const ALL: [Kind; 4] = [
        Kind::Started,
        Kind::RestartedWarn,
        Kind::StoppedWarn,
        Kind::StoppedError,
    ];

    /// Component state sent to the state manager.
    pub fn state(&self) -> &'static str {
        match self {
            Kind::Started | Kind::RestartedWarn | Kind::StoppedWarn => "Ready",
            Kind::StoppedError => "Standby",
        }
    }

    /// Component flag sent to the state manager.
    pub fn flag(&self) -> &'static str {
        match self {
            Kind::Started | Kind::RestartedWarn => "OK",
            Kind::StoppedWarn => "Warning",
            Kind::StoppedError => "Alert",
        }
    }

    /// Human-readable message carried in ExtendedInfo and on the bus.
    pub fn message(&self) -> &'static str {
        match self {
            Kind::Started => "Heartbeat started",
            Kind::RestartedWarn => "Heartbeat restarted",
            Kind::StoppedWarn => "Heartbeat stopped, might be dead",
            Kind::StoppedError => "Heartbeat stopped, declared dead",
        }
    }

    fn idx(&self) -> usize {
        match self {
            Kind::Started => 0,
            Kind::RestartedWarn => 1,
            Kind::StoppedWarn => 2,
            Kind::StoppedError => 3,
        }
    }
}

/// Bulk state-update request body, as the state manager's
/// `BulkStateData` endpoint expects it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BulkStateData {
    #[serde(rename = "ComponentIDs")]
    pub component_ids: Vec<String>,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Flag")]
    pub flag: String,
    #[serde(rename = "ExtendedInfo")]
    pub extended_info: ExtendedInfo,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExtendedInfo {
    #[serde(rename = "Message")]
    pub message: String,
}

/// One kind's pending bulk send for the current dispatch cycle.
#[derive(Debug, Clone)]
pub struct BulkPayload {
    pub kind: Kind,
    pub ids: Vec<String>,
    pub need_send: bool,
}

impl BulkPayload {
    pub fn body(&self) -> BulkStateData {
        BulkStateData {
            component_ids: self.ids.clone(),
            state: self.kind.state().to_string(),
            flag: self.kind.flag().to_string(),
            extended_info: ExtendedInfo {
                message: self.kind.message().to_string(),
            },
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NOTIFIER
// ════════════════════════════════════════════════════════════════════════════

struct Maps {
    /// Next sequence number; 0 is reserved as "absent".
    seq: u64,
    /// Write-through maps fed by notify(); drained every cycle.
    global: [HashMap<String, u64>; 4],
    /// Accumulated maps awaiting a confirmed state-manager send.
    persistent: [HashMap<String, u64>; 4],
}

pub struct Notifier {
    maps: Mutex<Maps>,
    bus: Arc<EventBus>,
}

impl Notifier {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            maps: Mutex::new(Maps {
                seq: 0,
                global: Default::default(),
                persistent: Default::default(),
            }),
            bus,
        }
    }

    /// Record a transition for a component and offer the matching bus
    /// notification. This is the only write path into the aggregator.
    pub fn notify(&self, rec: &HbRecord, kind: Kind) {
        {
            let mut maps = self.maps.lock();
            maps.seq += 1;
            let seq = maps.seq;
            maps.global[kind.idx()].insert(rec.component.clone(), seq);
        }

        self.bus.offer(BusMessage {
            message_id: BUS_MESSAGE_ID.to_string(),
            id: rec.component.clone(),
            new_state: kind.state().to_string(),
            new_flag: kind.flag().to_string(),
            last_hb_timestamp: rec.last_sender_ts.clone(),
            info: kind.message().to_string(),
        });
    }

    /// Merge the global maps into the persistent maps and clear the
    /// globals. Called once per dispatch cycle, even when the state
    /// manager is unreachable, so nothing pending is ever lost.
    pub fn merge(&self) {
        let mut maps = self.maps.lock();
        for i in 0..4 {
            let drained: Vec<(String, u64)> = maps.global[i].drain().collect();
            for (id, seq) in drained {
                maps.persistent[i].insert(id, seq);
            }
        }
    }

    /// Build the four bulk payloads from the persistent maps. Each
    /// touched component joins exactly one payload: the kind holding
    /// its highest sequence number.
    pub fn build_payloads(&self) -> Vec<BulkPayload> {
        let maps = self.maps.lock();

        let mut winners: [Vec<String>; 4] = Default::default();
        let mut touched: HashMap<&String, (usize, u64)> = HashMap::new();
        for i in 0..4 {
            for (id, seq) in &maps.persistent[i] {
                match touched.get(id) {
                    Some((_, best)) if *best >= *seq => {}
                    _ => {
                        touched.insert(id, (i, *seq));
                    }
                }
            }
        }
        for (id, (i, _)) in touched {
            winners[i].push(id.clone());
        }

        Kind::ALL
            .iter()
            .map(|k| {
                let mut ids = std::mem::take(&mut winners[k.idx()]);
                ids.sort();
                BulkPayload {
                    kind: *k,
                    need_send: !ids.is_empty(),
                    ids,
                }
            })
            .collect()
    }

    /// A bulk send for `kind` was accepted by the state manager: clear
    /// that kind's persistent map, and also clear the sent components
    /// from the other three maps. Without the cross-kind sweep, a later
    /// successful batch could resurrect an older, now-wrong state for
    /// the same component.
    pub fn confirm(&self, kind: Kind, sent_ids: &[String]) {
        let mut maps = self.maps.lock();
        maps.persistent[kind.idx()].clear();
        for i in 0..4 {
            if i == kind.idx() {
                continue;
            }
            for id in sent_ids {
                maps.persistent[i].remove(id);
            }
        }
    }

    /// Count of entries pending confirmation for a kind. Test hook.
    pub fn pending(&self, kind: Kind) -> usize {
        self.maps.lock().persistent[kind.idx()].len()
    }

    /// Count of not-yet-merged entries for a kind. Test hook.
    pub fn unmerged(&self, kind: Kind) -> usize {
        self.maps.lock().global[kind.idx()].len()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
