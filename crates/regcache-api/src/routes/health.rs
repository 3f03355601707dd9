//! `/health` and `/healthz` liveness probes.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
    uptime: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
    })
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health)).route("/healthz", get(health))
}
