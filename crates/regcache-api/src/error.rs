//! Maps `CoreError`/`StoreError` onto the three JSON error body shapes
//! described in the HTTP surface: a generic `{"error": "..."}`, the
//! `{"message":"UNAUTHORIZED"}` challenge body, and the route-table body for
//! unknown hosts (built directly by the route handler, not here).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regcache_core::CoreError;
use serde_json::json;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<regcache_store::StoreError> for ApiError {
    fn from(err: regcache_store::StoreError) -> Self {
        Self(CoreError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            CoreError::RouteNotFound(host) => (StatusCode::NOT_FOUND, format!("no route for host {host}")),
            CoreError::UpstreamUnavailable(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            CoreError::RedirectLoop(n) => (StatusCode::BAD_GATEWAY, format!("redirect loop: exceeded {n} hops")),
            CoreError::BadAuthChallenge(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            CoreError::CacheMiss => (StatusCode::NOT_FOUND, "cache miss".to_string()),
            CoreError::ContextCancelled => (StatusCode::REQUEST_TIMEOUT, "request cancelled".to_string()),
            CoreError::UpstreamStatus { status, .. } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                return (status, Json(json!({"error": "upstream error"}))).into_response();
            }
            CoreError::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            CoreError::Io(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}
