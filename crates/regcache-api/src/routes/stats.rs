//! `/stats` and `/stats/cache`: point-in-time counters and active
//! inflight-coalescer keys.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::state::AppState;

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.service.stats.snapshot();
    Json(json!({
        "uptime": state.uptime_secs(),
        "enabled": state.service.cache_enabled,
        "cache": snapshot,
    }))
}

async fn stats_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.service.stats.snapshot();
    Json(json!({
        "config": {
            "enabled": state.service.cache_enabled,
        },
        "stats": {
            "blob_hits": snapshot.blob_hits,
            "blob_misses": snapshot.blob_misses,
            "manifest_hits": snapshot.manifest_hits,
            "manifest_misses": snapshot.manifest_misses,
            "blob_count": snapshot.blob_count,
            "manifest_count": snapshot.manifest_count,
            "total_size": snapshot.total_size,
            "deduplicated": snapshot.deduplicated,
            "last_cleanup": snapshot.last_cleanup,
            "active_inflight_keys": state.service.coalescer.active_keys(),
        },
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(stats)).route("/stats/cache", get(stats_cache))
}
