//! `GET /health` (§6): liveness plus a snapshot of job registry stats.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::registry::RegistryStats;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub device: String,
    pub jobs: RegistryStats,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let jobs = state.registry.stats().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        device: state.settings.device.clone(),
        jobs,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
