//! Event bus publishing.
//!
//! Heartbeat change notifications are offered onto a bounded in-memory
//! queue by the ingestion and checker paths; a single consumer worker
//! drains the queue and writes JSON to the bus handle. Producers never
//! block and never fail: when the queue is full or the bus is down the
//! message is dropped with a log line. Bus trouble must never slow a
//! heartbeat POST.
//!
//! The wire client itself lives behind [`BusWriter`]; a reconnect
//! worker owns the handle lifecycle, tearing it down when telemetry is
//! switched off and rebuilding it when the configured `host:port:topic`
//! changes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use hbmon_common::{Error, Result};

use crate::params::ParamsHandle;

/// MessageID carried by every bus notification.
pub const BUS_MESSAGE_ID: &str = "Heartbeat Change Notification";

/// Queue depth between producers and the consumer worker.
pub const BUS_QUEUE_CAP: usize = 50_000;

// ════════════════════════════════════════════════════════════════════════════
// MESSAGE + WRITER SEAM
// ════════════════════════════════════════════════════════════════════════════

/// One heartbeat change notification, in its bus wire shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BusMessage {
    #[serde(rename = "MessageID")]
    pub message_id: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NewState")]
    pub new_state: String,
    #[serde(rename = "NewFlag")]
    pub new_flag: String,
    #[serde(rename = "LastHBTimeStamp")]
    pub last_hb_timestamp: String,
    #[serde(rename = "Info")]
    pub info: String,
}

/// A connected event bus handle. The concrete wire client is supplied
/// by the deployment; this service only needs to write.
#[async_trait]
pub trait BusWriter: Send + Sync {
    async fn write(&self, payload: &str) -> Result<()>;
}

/// Builds bus handles from a validated `host:port:topic` triple. The
/// reconnect worker calls this whenever a connection is needed.
pub trait BusConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16, topic: &str) -> Result<Box<dyn BusWriter>>;
}

/// HTTP bus writer: POSTs each notification to the bus gateway at
/// `http://host:port/<topic>`. Deployments front the message bus with
/// a REST proxy; this service only ever writes.
pub struct HttpBus {
    url: String,
    client: reqwest::Client,
}

impl HttpBus {
    pub fn new(host: &str, port: u16, topic: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Bus(format!("client build failed: {}", e)))?;
        Ok(Self {
            url: format!("http://{}:{}/{}", host, port, topic),
            client,
        })
    }
}

#[async_trait]
impl BusWriter for HttpBus {
    async fn write(&self, payload: &str) -> Result<()> {
        let rsp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| Error::Bus(format!("POST {}: {}", self.url, e)))?;
        if rsp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Bus(format!("POST {}: HTTP {}", self.url, rsp.status())))
        }
    }
}

/// Connector building [`HttpBus`] writers; installed by main.
pub struct HttpBusConnector;

impl BusConnector for HttpBusConnector {
    fn connect(&self, host: &str, port: u16, topic: &str) -> Result<Box<dyn BusWriter>> {
        Ok(Box::new(HttpBus::new(host, port, topic)?))
    }
}

/// Recording writer for tests.
#[derive(Default)]
pub struct MockBus {
    messages: parking_lot::Mutex<Vec<String>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl BusWriter for MockBus {
    async fn write(&self, payload: &str) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Bus("mock write failure".into()));
        }
        self.messages.lock().push(payload.to_string());
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// EVENT BUS (queue + handle)
// ════════════════════════════════════════════════════════════════════════════

pub struct EventBus {
    tx: mpsc::Sender<BusMessage>,
    /// Consumer end; taken once by the consumer worker.
    rx: parking_lot::Mutex<Option<mpsc::Receiver<BusMessage>>>,
    /// Connected handle, if any. Tokio mutex: held across the async
    /// write, and also taken by the reconnect worker when it swaps the
    /// connection out.
    writer: tokio::sync::Mutex<Option<Box<dyn BusWriter>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(BUS_QUEUE_CAP);
        Arc::new(Self {
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            writer: tokio::sync::Mutex::new(None),
        })
    }

    /// Non-blocking offer. Drops (with a log line) when the queue is
    /// full; never fails the caller.
    pub fn offer(&self, msg: BusMessage) {
        if self.tx.try_send(msg).is_err() {
            info!("Telemetry bus not accepting messages, heartbeat event not sent");
        }
    }

    /// Install a connected handle (reconnect worker, tests).
    pub async fn set_writer(&self, w: Box<dyn BusWriter>) {
        *self.writer.lock().await = Some(w);
    }

    /// Drop the current handle, if any. Returns whether one existed.
    pub async fn disconnect(&self) -> bool {
        self.writer.lock().await.take().is_some()
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<BusMessage>> {
        self.rx.lock().take()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// WORKERS
// ════════════════════════════════════════════════════════════════════════════

/// Consumer worker: pops queued notifications and writes them to the
/// bus. Sleeps while telemetry is off so toggling it does not lose the
/// handle state machine.
pub fn spawn_consumer(
    bus: Arc<EventBus>,
    params: ParamsHandle,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    let mut rx = bus
        .take_receiver()
        .expect("bus consumer may only be spawned once");
    tokio::spawn(async move {
        loop {
            if !params.read().use_telemetry {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = sleep(Duration::from_secs(5)) => continue,
                }
            }

            let msg = tokio::select! {
                _ = shutdown.notified() => return,
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => return,
                },
            };

            let payload = match serde_json::to_string(&msg) {
                Ok(p) => p,
                Err(e) => {
                    warn!("ERROR marshalling telemetry data: {}", e);
                    continue;
                }
            };

            let guard = bus.writer.lock().await;
            match guard.as_ref() {
                Some(w) => {
                    if let Err(e) = w.write(&payload).await {
                        warn!("ERROR injecting telemetry data: {}", e);
                    }
                }
                None => debug!("telemetry bus not connected, notification dropped"),
            }
        }
    })
}

/// Reconnect worker: reconciles the bus handle with the current
/// parameters every few seconds. Disconnects when telemetry is turned
/// off; (re)connects through the supplied connector when it is on and a
/// valid host spec is configured.
pub fn spawn_reconnector(
    bus: Arc<EventBus>,
    params: ParamsHandle,
    connector: Arc<dyn BusConnector>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (want, host_spec) = {
                let p = params.read();
                (p.use_telemetry, p.telemetry_host.clone())
            };

            if !want {
                if bus.disconnect().await {
                    info!("Disconnected from telemetry bus");
                }
            } else if !bus.is_connected().await {
                match crate::params::parse_telemetry_host(&host_spec) {
                    Ok((host, port, topic)) => match connector.connect(&host, port, &topic) {
                        Ok(w) => {
                            bus.set_writer(w).await;
                            info!("Connected to telemetry bus at {}:{} topic '{}'", host, port, topic);
                        }
                        Err(e) => warn!("ERROR connecting to telemetry bus, retrying: {}", e),
                    },
                    Err(e) => debug!("telemetry host is not set or is invalid: {}", e),
                }
            }

            tokio::select! {
                _ = shutdown.notified() => return,
                _ = sleep(Duration::from_secs(5)) => {}
            }
        }
    })
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
