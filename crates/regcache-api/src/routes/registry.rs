//! Top-level route table probe, the V2 auth broker endpoints, and the
//! registry passthrough surface. `parse_registry_path` splits on the last
//! occurrence of the well-known path segments rather than matching a rigid
//! route template, since repository names themselves may contain slashes.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use futures::StreamExt;
use regcache_core::router::strip_port;
use regcache_core::service::ResponseBody;
use regcache_core::CoreError;
use serde_json::json;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::state::AppState;

fn host_of(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()).map(strip_port).map(str::to_string)
}

async fn root(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(host) = host_of(&headers) else {
        return routes_listing(&state);
    };
    if state.service.resolve_upstream(&host).is_some() {
        return Redirect::permanent("/v2/").into_response();
    }
    routes_listing(&state)
}

fn routes_listing(state: &AppState) -> Response {
    let routes = state.service.router.routes();
    (StatusCode::NOT_FOUND, axum::Json(json!({"routes": routes, "message": "Available registry routes"}))).into_response()
}

/// The proxy's own `WWW-Authenticate` challenge, in place of whatever
/// upstream's was — the client re-negotiates a token against `/v2/auth`.
fn challenge_response(state: &AppState, host: &str) -> Response {
    let scheme = if state.debug { "http" } else { "https" };
    let challenge = regcache_core::auth::proxy_challenge(scheme, host);
    let mut resp = (StatusCode::UNAUTHORIZED, axum::Json(json!({"message": "UNAUTHORIZED"}))).into_response();
    resp.headers_mut().insert(axum::http::header::WWW_AUTHENTICATE, challenge.parse().unwrap());
    resp
}

async fn v2_probe(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(host) = host_of(&headers) else {
        return routes_listing(&state);
    };
    let Some(upstream) = state.service.resolve_upstream(&host) else {
        return routes_listing(&state);
    };
    match state.service.probe_v2(&upstream).await {
        Ok((status, Some(_challenge))) if status == StatusCode::UNAUTHORIZED => challenge_response(&state, &host),
        Ok((status, _)) => (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn v2_auth(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    let Some(host) = host_of(&headers) else {
        return routes_listing(&state);
    };
    let Some(upstream) = state.service.resolve_upstream(&host) else {
        return routes_listing(&state);
    };
    let scope = params.get("scope").map(String::as_str);
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    match state.service.broker_auth(&upstream, scope, authorization).await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = resp.bytes().await.unwrap_or_default();
            (status, body).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

enum ParsedPath {
    Manifest { repository: String, reference: String },
    Blob { repository: String, digest: String },
    Other,
}

fn parse_registry_path(path: &str) -> ParsedPath {
    if let Some(idx) = path.rfind("/manifests/") {
        let repository = path[..idx].trim_start_matches('/').to_string();
        let reference = path[idx + "/manifests/".len()..].to_string();
        return ParsedPath::Manifest { repository, reference };
    }
    if let Some(idx) = path.rfind("/blobs/") {
        let repository = path[..idx].trim_start_matches('/').to_string();
        let digest = path[idx + "/blobs/".len()..].to_string();
        return ParsedPath::Blob { repository, digest };
    }
    ParsedPath::Other
}

async fn registry_passthrough(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    path: axum::extract::Path<String>,
) -> Result<Response, ApiError> {
    let host = host_of(&headers).ok_or(ApiError::from(CoreError::RouteNotFound("missing Host header".into())))?;
    let upstream = state.service.resolve_upstream(&host).ok_or_else(|| ApiError::from(CoreError::RouteNotFound(host.clone())))?;

    if method != Method::GET && method != Method::HEAD {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }

    let full_path = format!("/v2/{}", path.0);
    if let Some(rewrite) = regcache_core::rewrite::rewrite_library_path(&full_path) {
        return Ok(Redirect::permanent(&rewrite.rewritten_path).into_response());
    }

    let accept = headers.get(axum::http::header::ACCEPT).and_then(|v| v.to_str().ok());
    let head = method == Method::HEAD;

    let fetch_result = match (parse_registry_path(&path.0), head) {
        (ParsedPath::Manifest { repository, reference }, false) => {
            state.service.get_manifest(&upstream, &repository, &reference, accept).await
        }
        (ParsedPath::Manifest { repository, reference }, true) => {
            state.service.head_manifest(&upstream, &repository, &reference, accept).await
        }
        (ParsedPath::Blob { repository, digest }, false) => state.service.get_blob(&upstream, &repository, &digest).await,
        (ParsedPath::Blob { repository, digest }, true) => state.service.head_blob(&upstream, &repository, &digest).await,
        (ParsedPath::Other, _) => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let service_response = match fetch_result {
        // resource request hit a 401, whether surfaced as an error or
        // relayed verbatim by a non-caching fallback fetch: re-issue the
        // proxy's own challenge so the client re-negotiates a token,
        // instead of relaying a dead end.
        Ok(resp) if resp.status == 401 => return Ok(challenge_response(&state, &host)),
        Ok(resp) => resp,
        Err(CoreError::UpstreamStatus { status: 401, .. }) => return Ok(challenge_response(&state, &host)),
        Err(err) => return Err(ApiError::from(err)),
    };

    Ok(render(service_response, head))
}

fn render(service_response: regcache_core::service::ServiceResponse, head: bool) -> Response {
    let status = StatusCode::from_u16(service_response.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &service_response.headers {
        builder = builder.header(name, value);
    }
    builder = builder.header("x-cache", service_response.cache_status.as_header_value());

    if head {
        return builder.body(Body::empty()).unwrap();
    }

    match service_response.body {
        ResponseBody::Buffered(bytes) => builder.body(Body::from(bytes)).unwrap(),
        ResponseBody::Streamed(stream) => {
            let mapped = stream.map(|r| r.map_err(std::io::Error::other));
            builder.body(Body::from_stream(mapped)).unwrap()
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/v2", get(v2_probe))
        .route("/v2/", get(v2_probe))
        .route("/v2/auth", get(v2_auth))
        .route("/v2/{*path}", any(registry_passthrough))
}