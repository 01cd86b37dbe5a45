//! Bulk dispatch to the state manager.
//!
//! A dedicated worker, kicked over a channel after every scan. Each
//! cycle merges the aggregator's pending transitions, builds up to four
//! bulk payloads (one per transition kind), and sends them in parallel.
//! A kind whose PATCH is accepted is confirmed back into the
//! aggregator; a kind that fails keeps its entries and rides the next
//! cycle. That is the whole retry model: no in-cycle retries, retry is
//! intrinsic across scans.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::notify::BulkPayload;
use crate::state::AppState;

/// One dispatch cycle. Public so tests drive it directly.
pub async fn dispatch_once(st: &AppState) {
    // Always fold pending transitions into the persistent maps, even
    // when nothing can be sent; they must survive until a send works.
    st.notifier.merge();

    let nosm = st.params.read().nosm;
    if !nosm && !st.hsm_ready.load(Ordering::SeqCst) {
        info!("HSM not ready, holding state updates for next scan");
        return;
    }

    let payloads: Vec<BulkPayload> = st
        .notifier
        .build_payloads()
        .into_iter()
        .filter(|p| p.need_send)
        .collect();
    if payloads.is_empty() {
        return;
    }

    if nosm {
        // Test/bring-up mode: drop the updates as if accepted.
        for p in &payloads {
            debug!("nosm: discarding {:?} update for {} component(s)", p.kind, p.ids.len());
            st.notifier.confirm(p.kind, &p.ids);
        }
        return;
    }

    let mut senders = Vec::with_capacity(payloads.len());
    for p in payloads {
        let hsm = st.hsm.clone();
        senders.push(tokio::spawn(async move {
            let outcome = hsm.bulk_update(&p.body()).await;
            (p, outcome)
        }));
    }

    for sender in senders {
        match sender.await {
            Ok((p, Ok(()))) => {
                debug!("state manager accepted {:?} update for {} component(s)", p.kind, p.ids.len());
                st.notifier.confirm(p.kind, &p.ids);
            }
            Ok((p, Err(e))) => {
                warn!(
                    "ERROR sending {:?} update to state manager, will retry next scan: {}",
                    p.kind, e
                );
            }
            Err(e) => warn!("dispatch sender task failed: {}", e),
        }
    }
}

/// Dispatch worker loop. Kicks collapse: if several scans queue while a
/// cycle is in flight, one following cycle covers them all.
pub fn spawn_dispatcher(
    st: Arc<AppState>,
    mut rx: mpsc::Receiver<()>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                kick = rx.recv() => {
                    if kick.is_none() {
                        return;
                    }
                    dispatch_once(&st).await;
                }
            }
        }
    })
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
