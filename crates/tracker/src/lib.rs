//! # hbmon Tracker
//!
//! Fleet heartbeat tracking service. Compute nodes POST periodic
//! heartbeats; the tracker detects when a node starts heartbeating,
//! when it has been quiet long enough to warn about, and when it must
//! be declared dead, and reports each transition to the hardware state
//! manager (bulk PATCH) and onto the event bus.
//!
//! Any number of replicas run behind a load balancer. Shared state
//! lives in the cluster KV store; a distributed try-lock elects the
//! replica that runs each overdue-check scan, and ephemeral
//! liveness-witness keys distinguish "the node died" from "nobody was
//! watching".
//!
//! Module map:
//!
//! | Module | Role |
//! |---|---|
//! | [`config`] | defaults / env / CLI layering |
//! | [`params`] | runtime-tunable shared parameter record |
//! | [`records`] | heartbeat record storage types |
//! | [`ingest`] | heartbeat upsert path |
//! | [`checker`] | periodic overdue scan |
//! | [`notify`] | transition aggregation, last-write-wins |
//! | [`dispatch`] | bulk PATCH fan-out to the state manager |
//! | [`hsm`] | state manager client + readiness monitor |
//! | [`bus`] | event bus queue and workers |
//! | [`witness`] | liveness witness protocol |
//! | [`api`] / [`handlers`] | HTTP surface |

pub mod api;
pub mod bus;
pub mod checker;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod hsm;
pub mod ingest;
pub mod notify;
pub mod params;
pub mod records;
pub mod state;
pub mod witness;
