//! V2 auth broker: mirrors the upstream bearer challenge and brokers the
//! token handshake on the client's behalf.
//!
//! The `WWW-Authenticate` parser below splits on commas (respecting
//! quotes) into an arbitrary key=value map rather than a fixed struct,
//! since different upstreams attach different extra parameters.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::CoreError;
use crate::rewrite::rewrite_scope;

pub const PROXY_SERVICE_NAME: &str = "go-docker-proxy";

/// Parses a `Bearer realm="...",service="...",scope="..."` header value into
/// its key="value" pairs.
pub fn parse_bearer_challenge(header_value: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(rest) = header_value.trim().strip_prefix("Bearer ") else {
        return out;
    };
    for part in split_params(rest) {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            out.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
    }
    out
}

/// Splits on commas that are not inside a quoted value.
fn split_params(input: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(input[start..].trim());
    out
}

/// Probes `<upstream>/v2/`, retrying transport errors up to 3 times with a
/// 0/100ms/200ms linear backoff, and returns the raw `WWW-Authenticate`
/// value if the upstream challenges.
pub async fn probe_challenge(client: &Client, upstream: &str) -> Result<(StatusCode, Option<String>), CoreError> {
    let url = format!("{upstream}/v2/");
    let mut last_err = None;
    for attempt in 0..3u32 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        match client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status();
                let challenge = resp
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                return Ok((status, challenge));
            }
            Err(err) => {
                debug!(attempt, %err, "probe attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(CoreError::UpstreamUnavailable(last_err.expect("loop always attempts at least once")))
}

/// Builds the proxy's own challenge header value, pointing `realm` back at
/// itself.
pub fn proxy_challenge(scheme: &str, host: &str) -> String {
    format!(r#"Bearer realm="{scheme}://{host}/v2/auth",service="{PROXY_SERVICE_NAME}""#)
}

/// Brokers a token request: fetches the upstream challenge, rewrites scope
/// for Docker Hub, and issues the token GET with the client's `scope` and
/// optional `Authorization` header.
pub async fn broker_token(
    client: &Client,
    upstream: &str,
    is_docker_hub: bool,
    client_scope: Option<&str>,
    client_authorization: Option<&str>,
) -> Result<reqwest::Response, CoreError> {
    let (_, challenge) = probe_challenge(client, upstream).await?;
    let challenge = challenge.ok_or_else(|| CoreError::BadAuthChallenge("no WWW-Authenticate header".into()))?;
    let params = parse_bearer_challenge(&challenge);
    let realm = params.get("realm").ok_or_else(|| CoreError::BadAuthChallenge("missing realm".into()))?;
    let service = params.get("service").cloned().unwrap_or_default();

    let scope = client_scope.map(|s| if is_docker_hub { rewrite_scope(s) } else { s.to_string() });

    let mut req = client.get(realm).query(&[("service", service.as_str())]);
    if let Some(scope) = &scope {
        req = req.query(&[("scope", scope.as_str())]);
    }
    if let Some(authorization) = client_authorization {
        req = req.header(reqwest::header::AUTHORIZATION, authorization);
    }
    req.send().await.map_err(CoreError::UpstreamUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_fields() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:nginx:pull""#;
        let parsed = parse_bearer_challenge(header);
        assert_eq!(parsed.get("realm").unwrap(), "https://auth.docker.io/token");
        assert_eq!(parsed.get("service").unwrap(), "registry.docker.io");
        assert_eq!(parsed.get("scope").unwrap(), "repository:nginx:pull");
    }

    #[test]
    fn missing_bearer_prefix_yields_empty_map() {
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_empty());
    }

    #[test]
    fn proxy_challenge_points_back_at_self() {
        let value = proxy_challenge("https", "docker.example.com");
        assert!(value.contains(r#"realm="https://docker.example.com/v2/auth""#));
        assert!(value.contains(PROXY_SERVICE_NAME));
    }

    #[test]
    fn split_params_respects_quoting() {
        let parts = split_params(r#"realm="a,b",service="c""#);
        assert_eq!(parts, vec![r#"realm="a,b""#, r#"service="c""#]);
    }
}
