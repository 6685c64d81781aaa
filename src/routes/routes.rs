//! HTTP surface of the relay worker.
//!
//! - `GET /healthz` — liveness
//! - `GET /readyz`  — ledger + staging directory checks
//! - `GET /status`  — retry queue depth, buckets, recent deliveries and logs

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        status_handlers::status,
    },
    services::ledger::Ledger,
};
use axum::{Router, routing::get};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub staging_dir: PathBuf,
    pub poll_interval_minutes: u32,
    pub started_at: DateTime<Utc>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
}
