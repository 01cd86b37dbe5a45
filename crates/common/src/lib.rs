//! # hbmon Common Crate
//!
//! Shared leaf code for the hbmon heartbeat tracking service:
//!
//! - [`xname`]: component name (xname) normalization, validation and
//!   HMS type classification
//! - [`problem`]: RFC 7807 problem-details responses
//! - [`kv`]: the typed key/value facade over the cluster KV store,
//!   with an etcd JSON-gateway implementation and an in-memory
//!   implementation for tests
//!
//! Everything here is independent of the tracker service itself so it
//! can be reused by companion tools (fleet inspectors, test harnesses).

pub mod error;
pub mod kv;
pub mod problem;
pub mod xname;

pub use error::{Error, Result};
pub use kv::{KvPair, KvStore};
pub use problem::ProblemDetails;
pub use xname::HmsType;
