//! Hardware state manager (HSM) client and readiness monitoring.
//!
//! Outbound traffic to the HSM is all of two calls: a readiness probe
//! and the bulk state PATCH. Both go through the [`StateMgrClient`]
//! seam so the dispatch pipeline can be exercised against a recording
//! mock; [`HttpStateMgr`] is the production implementation.
//!
//! A background poller probes `/service/ready` every five seconds and
//! publishes the result into the shared `hsm_ready` flag. Startup
//! blocks on that flag before opening the listener: the tracker is no
//! use without somewhere to report to.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use hbmon_common::{Error, Result};

use crate::notify::BulkStateData;
use crate::params::ParamsHandle;
use crate::records::now_wall;
use crate::state::AppState;

/// Readiness probe path under the HSM base URL.
pub const SM_URL_READY: &str = "service/ready";
/// Bulk state update path under the HSM base URL.
pub const SM_URL_BULK: &str = "State/Components/BulkStateData";

/// Poll period for the readiness monitor.
const READY_POLL_SECS: u64 = 5;

// ════════════════════════════════════════════════════════════════════════════
// CLIENT SEAM
// ════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait StateMgrClient: Send + Sync {
    /// One readiness probe; true iff the HSM answered 200.
    async fn ready(&self) -> bool;

    /// One bulk state PATCH. 200/204/202 count as accepted; anything
    /// else (including transport failure) is an error and the caller
    /// retains the payload for a later scan.
    async fn bulk_update(&self, body: &BulkStateData) -> Result<()>;
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

pub struct HttpStateMgr {
    client: reqwest::Client,
    params: ParamsHandle,
    service_name: String,
}

impl HttpStateMgr {
    /// The base URL and per-request timeout are read from the live
    /// parameters on every call, so a params PATCH takes effect without
    /// a restart. In-cluster HSM endpoints present certs we do not
    /// verify, matching the deployment's service mesh posture.
    pub fn new(params: ParamsHandle, service_name: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::StateMgr(format!("client build failed: {}", e)))?;
        Ok(Self {
            client,
            params,
            service_name,
        })
    }

    fn base_and_timeout(&self) -> (String, Duration) {
        let p = self.params.read();
        (
            p.sm_url.trim_end_matches('/').to_string(),
            Duration::from_secs(p.sm_timeout_secs.max(1) as u64),
        )
    }
}

#[async_trait]
impl StateMgrClient for HttpStateMgr {
    async fn ready(&self) -> bool {
        let (base, timeout) = self.base_and_timeout();
        let url = format!("{}/{}", base, SM_URL_READY);
        match self
            .client
            .get(&url)
            .timeout(timeout)
            .header(reqwest::header::USER_AGENT, &self.service_name)
            .send()
            .await
        {
            Ok(rsp) => rsp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    async fn bulk_update(&self, body: &BulkStateData) -> Result<()> {
        let (base, timeout) = self.base_and_timeout();
        let url = format!("{}/{}", base, SM_URL_BULK);
        debug!("Sending PATCH to state manager URL '{}'", url);

        let rsp = self
            .client
            .patch(&url)
            .timeout(timeout)
            .header(reqwest::header::USER_AGENT, &self.service_name)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::StateMgr(format!("PATCH {}: {}", url, e)))?;

        match rsp.status().as_u16() {
            200 | 202 | 204 => Ok(()),
            code => Err(Error::StateMgr(format!("PATCH {}: HTTP {}", url, code))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RECORDING MOCK
// ════════════════════════════════════════════════════════════════════════════

/// Test double: answers readiness from a flag and bulk updates with a
/// settable status code, recording accepted payloads.
#[derive(Default)]
pub struct MockStateMgr {
    ready: std::sync::atomic::AtomicBool,
    status: std::sync::atomic::AtomicU16,
    accepted: parking_lot::Mutex<Vec<BulkStateData>>,
}

impl MockStateMgr {
    pub fn new() -> Self {
        let m = Self::default();
        m.ready.store(true, Ordering::SeqCst);
        m.status.store(200, Ordering::SeqCst);
        m
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_status(&self, code: u16) {
        self.status.store(code, Ordering::SeqCst);
    }

    /// Payloads the mock accepted (i.e. answered with success).
    pub fn accepted(&self) -> Vec<BulkStateData> {
        self.accepted.lock().clone()
    }

    pub fn clear_accepted(&self) {
        self.accepted.lock().clear();
    }
}

#[async_trait]
impl StateMgrClient for MockStateMgr {
    async fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn bulk_update(&self, body: &BulkStateData) -> Result<()> {
        match self.status.load(Ordering::SeqCst) {
            200 | 202 | 204 => {
                self.accepted.lock().push(body.clone());
                Ok(())
            }
            code => Err(Error::StateMgr(format!("HTTP {}", code))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// READINESS MONITOR
// ════════════════════════════════════════════════════════════════════════════

/// Background poller keeping `hsm_ready` current. Logs edges, not
/// every probe, except for a running not-responsive duration counter
/// so operators can see how long the HSM has been away.
pub fn spawn_ready_monitor(st: Arc<AppState>, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if st.params.read().nosm {
            // Nothing will ever be sent; report permanently ready so
            // startup does not block.
            st.hsm_ready.store(true, Ordering::SeqCst);
            return;
        }

        let mut prev = false;
        let mut off_base = now_wall();

        loop {
            let ready = st.hsm.ready().await;
            st.hsm_ready.store(ready, Ordering::SeqCst);

            if !ready {
                info!("HSM is not responsive ({} seconds)", now_wall() - off_base);
            } else {
                off_base = now_wall();
                if !prev {
                    info!("HSM is responsive");
                }
            }
            prev = ready;

            tokio::select! {
                _ = shutdown.notified() => return,
                _ = sleep(Duration::from_secs(READY_POLL_SECS)) => {}
            }
        }
    })
}

/// Block until the readiness monitor has seen the HSM answer. Skipped
/// entirely in `nosm` mode.
pub async fn wait_for_ready(st: &AppState) {
    if st.params.read().nosm {
        return;
    }
    info!("Waiting for HSM to be responsive...");
    while !st.hsm_ready.load(Ordering::SeqCst) {
        sleep(Duration::from_secs(3)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ExtendedInfo, Kind};

    fn body(kind: Kind, id: &str) -> BulkStateData {
        BulkStateData {
            component_ids: vec![id.to_string()],
            state: kind.state().to_string(),
            flag: kind.flag().to_string(),
            extended_info: ExtendedInfo {
                message: kind.message().to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_mock_accepts_success_codes() {
        let m = MockStateMgr::new();
        for code in [200u16, 202, 204] {
            m.set_status(code);
            assert!(m.bulk_update(&body(Kind::Started, "x0c0s0b0n0")).await.is_ok());
        }
        assert_eq!(m.accepted().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_rejects_and_records_nothing() {
        let m = MockStateMgr::new();
        m.set_status(500);
        assert!(m.bulk_update(&body(Kind::Started, "x0c0s0b0n0")).await.is_err());
        m.set_status(404);
        assert!(m.bulk_update(&body(Kind::Started, "x0c0s0b0n0")).await.is_err());
        assert!(m.accepted().is_empty());
    }

    #[tokio::test]
    async fn test_mock_readiness_flag() {
        let m = MockStateMgr::new();
        assert!(m.ready().await);
        m.set_ready(false);
        assert!(!m.ready().await);
    }
}
