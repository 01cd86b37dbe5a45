//! Service entry point.
//!
//! Startup order matters here:
//!
//! 1. configuration (env, then command line)
//! 2. KV store connection, retried forever (the service is worthless
//!    without it; probes stay down until it works)
//! 3. HSM readiness monitor, and a gate on first-ready
//! 4. parameter sync from the shared KV record
//! 5. liveness-witness check, then our own ephemeral witness key
//! 6. background workers: dispatcher, bus consumer and reconnector,
//!    overdue-check timer
//! 7. the HTTP listener, last, with graceful shutdown on SIGINT/SIGTERM

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hbmon_common::kv::{EtcdKv, KvStore};

use hbmon_tracker::api;
use hbmon_tracker::bus::{self, EventBus, HttpBusConnector};
use hbmon_tracker::checker;
use hbmon_tracker::config;
use hbmon_tracker::dispatch;
use hbmon_tracker::hsm::{self, HttpStateMgr};
use hbmon_tracker::params::{self, ParamsHandle};
use hbmon_tracker::state::{AppState, SCAN_LOCK_NAME};
use hbmon_tracker::witness;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Fleet heartbeat monitor/tracker started");

    let initial = match config::build() {
        Ok(Some(p)) => p,
        Ok(None) => {
            let prog = std::env::args().next().unwrap_or_else(|| "hbmon-tracker".to_string());
            print!("{}", config::usage(&prog));
            return;
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let service_name = config::service_instance_name();
    info!("Service name: '{}'", service_name);

    let params: ParamsHandle = Arc::new(RwLock::new(initial));
    let shutdown = Arc::new(Notify::new());

    // KV store connection. No URL configured is a permanent error, but
    // the process parks instead of exiting so orchestration probes
    // report unready rather than crash-looping.
    let kv_url = params.read().kv_url.clone();
    if kv_url.is_empty() {
        error!("KV URL is not set (no ETCD_HOST/ETCD_PORT and no kv_url), can't continue");
        loop {
            sleep(Duration::from_secs(1000)).await;
        }
    }

    let kv: Arc<dyn KvStore> = {
        let mut attempt = 1;
        loop {
            match EtcdKv::open(&kv_url, SCAN_LOCK_NAME).await {
                Ok(kv) => {
                    info!("KV store connection succeeded");
                    break Arc::new(kv) as Arc<dyn KvStore>;
                }
                Err(e) => {
                    error!("ERROR opening connection to KV store ({}) (attempt {}): {}", kv_url, attempt, e);
                    attempt += 1;
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };

    let hsm_client = match HttpStateMgr::new(params.clone(), service_name.clone()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("FATAL: can't build state manager client: {}", e);
            std::process::exit(1);
        }
    };

    let event_bus = EventBus::new();
    let (dispatch_tx, dispatch_rx) = mpsc::channel(8);
    let st = AppState::new(
        params.clone(),
        kv.clone(),
        hsm_client,
        event_bus.clone(),
        dispatch_tx,
        service_name,
    );

    // HSM readiness: monitor in the background, gate startup on the
    // first success (skipped in nosm mode).
    let ready_handle = hsm::spawn_ready_monitor(st.clone(), shutdown.clone());
    hsm::wait_for_ready(&st).await;

    // A parameter record already in the KV store reflects the fleet's
    // last PATCH; it overrides local defaults, env and flags.
    params::sync_from_kv(kv.as_ref(), &params).await;

    // Witness protocol: find out whether anyone was watching while we
    // were gone, then announce that we are watching now.
    let clear_on_gap = params.read().clear_on_gap;
    let stale = witness::check_life_keys(kv.as_ref(), clear_on_gap).await;
    st.stale_keys.store(stale, Ordering::SeqCst);
    let witness_handle = witness::spawn_witness(st.clone(), witness::instance_key(), shutdown.clone());

    // Workers.
    let dispatcher_handle = dispatch::spawn_dispatcher(st.clone(), dispatch_rx, shutdown.clone());
    let consumer_handle = bus::spawn_consumer(event_bus.clone(), params.clone(), shutdown.clone());
    let reconnect_handle = bus::spawn_reconnector(
        event_bus.clone(),
        params.clone(),
        Arc::new(HttpBusConnector),
        shutdown.clone(),
    );
    let checker_handle = checker::spawn_checker(st.clone(), shutdown.clone());

    // HTTP listener, last.
    let port = params.read().port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("FATAL: can't bind listener on {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Listening on port {}", port);

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(listener, api::router(st.clone()))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown requested, draining in-flight requests");
            serve_shutdown.notify_waiters();
        });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    // Workers exit on the shutdown notify; the ephemeral witness key
    // disappears with our KV session.
    let _ = tokio::join!(
        ready_handle,
        witness_handle,
        dispatcher_handle,
        consumer_handle,
        reconnect_handle,
        checker_handle,
    );

    info!("Server shutdown complete");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("can't install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
