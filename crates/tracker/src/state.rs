//! Shared application state.
//!
//! One `Arc<AppState>` is handed to every worker and every request
//! handler. Fields that cross the sync/async boundary are atomics or
//! handles that manage their own locking.

use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Arc;

use tokio::sync::mpsc;

use hbmon_common::KvStore;

use crate::bus::EventBus;
use crate::hsm::StateMgrClient;
use crate::notify::Notifier;
use crate::params::ParamsHandle;

/// Name of the fleet-wide scan lock in the KV store.
pub const SCAN_LOCK_NAME: &str = "hbmon_scan_lock";

pub struct AppState {
    /// Live operating parameters (shared with the KV record).
    pub params: ParamsHandle,
    /// KV store facade.
    pub kv: Arc<dyn KvStore>,
    /// Transition aggregator.
    pub notifier: Notifier,
    /// Event bus queue + handle.
    pub bus: Arc<EventBus>,
    /// State manager client.
    pub hsm: Arc<dyn StateMgrClient>,
    /// Published by the readiness monitor; gates dispatch.
    pub hsm_ready: AtomicBool,
    /// True when no liveness witness existed at startup; cleared at the
    /// end of the first successful scan.
    pub stale_keys: AtomicBool,
    /// Components seen heartbeating by the last scan; -1 before the
    /// first scan. Only logged when it changes.
    pub live_count: AtomicI64,
    /// Instance name carried in outbound User-Agent headers.
    pub service_name: String,
    /// Kick channel into the dispatch worker; offered non-blocking
    /// after every scan.
    pub dispatch_tx: mpsc::Sender<()>,
}

impl AppState {
    pub fn new(
        params: ParamsHandle,
        kv: Arc<dyn KvStore>,
        hsm: Arc<dyn StateMgrClient>,
        bus: Arc<EventBus>,
        dispatch_tx: mpsc::Sender<()>,
        service_name: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            kv,
            notifier: Notifier::new(bus.clone()),
            bus,
            hsm,
            hsm_ready: AtomicBool::new(false),
            stale_keys: AtomicBool::new(false),
            live_count: AtomicI64::new(-1),
            service_name,
            dispatch_tx,
        })
    }

    /// Ask the dispatch worker to run a cycle. Non-blocking: if a kick
    /// is already queued the new one is redundant anyway.
    pub fn kick_dispatch(&self) {
        let _ = self.dispatch_tx.try_send(());
    }
}
