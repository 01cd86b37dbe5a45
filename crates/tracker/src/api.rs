//! API route table.
//!
//! Everything lives under `/hmi/v1`. Each route is method-bound with a
//! fallback that produces the problem-details 405 (with its mandatory
//! `Allow` header) instead of axum's bare default.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub const URL_ROOT: &str = "/hmi/v1";
pub const URL_HEARTBEAT: &str = "/hmi/v1/heartbeat";
pub const URL_PARAMS: &str = "/hmi/v1/params";
pub const URL_HB_STATES: &str = "/hmi/v1/hbstates";
pub const URL_HB_STATE: &str = "/hmi/v1/hbstate";
pub const URL_HEALTH: &str = "/hmi/v1/health";
pub const URL_LIVENESS: &str = "/hmi/v1/liveness";
pub const URL_READINESS: &str = "/hmi/v1/readiness";

pub fn router(st: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/hmi/v1/heartbeat",
            post(handlers::hb_rcv).fallback(handlers::heartbeat_method_na),
        )
        .route(
            "/hmi/v1/heartbeat/{xname}",
            post(handlers::hb_rcv_xname).fallback(handlers::heartbeat_method_na),
        )
        .route(
            "/hmi/v1/params",
            get(handlers::params_get)
                .patch(handlers::params_patch)
                .fallback(handlers::params_method_na),
        )
        .route(
            "/hmi/v1/hbstates",
            post(handlers::hb_states).fallback(handlers::hb_states_method_na),
        )
        .route(
            "/hmi/v1/hbstate/{xname}",
            get(handlers::hb_state_single).fallback(handlers::hb_state_method_na),
        )
        .route(
            "/hmi/v1/health",
            get(handlers::health).fallback(handlers::get_only_method_na),
        )
        .route(
            "/hmi/v1/liveness",
            get(handlers::liveness).fallback(handlers::get_only_method_na),
        )
        .route(
            "/hmi/v1/readiness",
            get(handlers::readiness).fallback(handlers::get_only_method_na),
        )
        .with_state(st)
}
