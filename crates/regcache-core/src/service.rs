//! Orchestrates the router, auth broker, redirect classifier, streaming
//! pipeline, coalescer and the two on-disk stores into the request flows
//! described by the data/control-flow diagram: a cache lookup backed by the
//! descriptor index, falling through to a coalesced upstream fetch with
//! cache admission on a cacheable miss.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info};

use regcache_store::{BlobStore, CacheEntry, Descriptor, ManifestKey, ManifestStore};

use crate::coalesce::{Coalescer, TryStart};
use crate::error::CoreError;
use crate::proxy::{build_upstream_request, classify_admission, filter_headers, tee_for_cache};
use crate::redirect::{RedirectClassifier, RedirectDecision, MAX_SERVER_SIDE_REDIRECTS};
use crate::router::Router;
use crate::stats::Stats;

pub type ServiceStream = Pin<Box<dyn Stream<Item = Result<Bytes, CoreError>> + Send>>;

/// A fully-resolved HTTP response ready for the API layer to render.
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cache_status: CacheStatus,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Buffered(Bytes),
    Streamed(ServiceStream),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_header_value(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

pub struct ProxyService {
    pub router: Router,
    pub client: Client,
    pub classifier: RedirectClassifier,
    pub coalescer: Coalescer,
    pub stats: Arc<Stats>,
    pub blobs: Arc<BlobStore>,
    pub manifests: Arc<ManifestStore>,
    pub cache_enabled: bool,
}

impl ProxyService {
    pub fn resolve_upstream(&self, host: &str) -> Option<String> {
        self.router.resolve(host).map(str::to_string)
    }

    /// `GET /v2/` probe: forwards the status; rewrites a `401` challenge to
    /// point back at the proxy.
    pub async fn probe_v2(&self, upstream: &str) -> Result<(StatusCode, Option<String>), CoreError> {
        crate::auth::probe_challenge(&self.client, upstream).await
    }

    /// `GET /v2/auth`: brokers the token handshake.
    pub async fn broker_auth(
        &self,
        upstream: &str,
        client_scope: Option<&str>,
        client_authorization: Option<&str>,
    ) -> Result<reqwest::Response, CoreError> {
        let is_docker_hub = Router::is_docker_hub(upstream);
        crate::auth::broker_token(&self.client, upstream, is_docker_hub, client_scope, client_authorization).await
    }

    /// Cache-aside manifest fetch, coalesced on `repo + reference`.
    pub async fn get_manifest(
        &self,
        upstream: &str,
        repository: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> Result<ServiceResponse, CoreError> {
        let key = ManifestKey::new(repository, reference);

        if self.cache_enabled {
            if let Some(entry) = self.manifests.get(&key).await? {
                self.stats.record_manifest_hit();
                return Ok(cached_entry_response(entry, CacheStatus::Hit));
            }
        }
        self.stats.record_manifest_miss();

        let coalesce_key = format!("manifest:{}", key.cache_key());
        match self.coalescer.try_start(&coalesce_key) {
            TryStart::First(first) => {
                let result = self.fetch_and_cache_manifest(upstream, &key, accept).await;
                first.done(result.as_ref().err().map(|e| e.to_string()));
                result
            }
            TryStart::Follower(follower) => {
                self.stats.record_dedup();
                let cancel = std::future::pending::<()>();
                if follower.wait(cancel).await.is_ok() {
                    if let Some(entry) = self.manifests.get(&key).await? {
                        return Ok(cached_entry_response(entry, CacheStatus::Hit));
                    }
                }
                // fall back to a direct, non-caching fetch.
                self.direct_manifest_fetch(upstream, repository, reference, accept).await
            }
        }
    }

    async fn fetch_and_cache_manifest(
        &self,
        upstream: &str,
        key: &ManifestKey,
        accept: Option<&str>,
    ) -> Result<ServiceResponse, CoreError> {
        let path = format!("/v2/{}/manifests/{}", key.repository, key.reference);
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(reqwest::header::ACCEPT, accept.parse().unwrap());
        }
        let req = build_upstream_request(&self.client, Method::GET, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(CoreError::UpstreamStatus { status: 401, body: Vec::new() });
        }
        if status.is_redirection() {
            return self.follow_redirect_for_manifest(resp, key).await;
        }
        if status != StatusCode::OK {
            let body = resp.bytes().await.unwrap_or_default().to_vec();
            return Err(CoreError::UpstreamStatus { status: status.as_u16(), body });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let digest_header =
            resp.headers().get("docker-content-digest").and_then(|v| v.to_str().ok()).map(str::to_string);
        let headers_out: Vec<(String, String)> = filter_headers(resp.headers())
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp.bytes().await.map_err(CoreError::UpstreamUnavailable)?;

        if self.cache_enabled {
            let descriptor = Descriptor::new(
                digest_header.unwrap_or_else(|| regcache_store::compute_sha256(&body)),
                body.len() as u64,
                Some(content_type.clone()),
            );
            let entry = CacheEntry {
                descriptor,
                headers: headers_out.clone(),
                status_code: 200,
                data: Some(body.to_vec()),
                body_path: None,
                cached_at: chrono::Utc::now(),
                expires_at: chrono::Utc::now(),
            };
            self.manifests.put(key, entry).await?;
        }

        Ok(ServiceResponse { status: 200, headers: headers_out, cache_status: CacheStatus::Miss, body: ResponseBody::Buffered(body) })
    }

    async fn follow_redirect_for_manifest(
        &self,
        mut resp: reqwest::Response,
        key: &ManifestKey,
    ) -> Result<ServiceResponse, CoreError> {
        let mut hops = 0u32;
        loop {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let Some(location) = location else {
                // unparseable/absent Location: treat as terminal and relay.
                let status = resp.status().as_u16();
                let body = resp.bytes().await.unwrap_or_default();
                return Ok(ServiceResponse {
                    status,
                    headers: vec![],
                    cache_status: CacheStatus::Bypass,
                    body: ResponseBody::Buffered(body),
                });
            };

            match self.classifier.classify(&location) {
                RedirectDecision::RelayToClient => {
                    return Ok(ServiceResponse {
                        status: resp.status().as_u16(),
                        headers: vec![("location".to_string(), location)],
                        cache_status: CacheStatus::Bypass,
                        body: ResponseBody::Buffered(Bytes::new()),
                    });
                }
                RedirectDecision::FollowServerSide => {
                    hops += 1;
                    if hops > MAX_SERVER_SIDE_REDIRECTS {
                        return Err(CoreError::RedirectLoop(MAX_SERVER_SIDE_REDIRECTS));
                    }
                    let next = self.client.get(&location).send().await.map_err(CoreError::UpstreamUnavailable)?;
                    if next.status().is_redirection() {
                        resp = next;
                        continue;
                    }
                    let status = next.status();
                    if status != StatusCode::OK {
                        let body = next.bytes().await.unwrap_or_default().to_vec();
                        return Err(CoreError::UpstreamStatus { status: status.as_u16(), body });
                    }
                    let content_type = next
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let headers_out: Vec<(String, String)> = filter_headers(next.headers())
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                        .collect();
                    let body = next.bytes().await.map_err(CoreError::UpstreamUnavailable)?;
                    if self.cache_enabled {
                        let descriptor = Descriptor::new(regcache_store::compute_sha256(&body), body.len() as u64, content_type);
                        let entry = CacheEntry {
                            descriptor,
                            headers: headers_out.clone(),
                            status_code: 200,
                            data: Some(body.to_vec()),
                            body_path: None,
                            cached_at: chrono::Utc::now(),
                            expires_at: chrono::Utc::now(),
                        };
                        self.manifests.put(key, entry).await?;
                    }
                    return Ok(ServiceResponse { status: 200, headers: headers_out, cache_status: CacheStatus::Miss, body: ResponseBody::Buffered(body) });
                }
            }
        }
    }

    async fn direct_manifest_fetch(
        &self,
        upstream: &str,
        repository: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> Result<ServiceResponse, CoreError> {
        let path = format!("/v2/{repository}/manifests/{reference}");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(reqwest::header::ACCEPT, accept.parse().unwrap());
        }
        let req = build_upstream_request(&self.client, Method::GET, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(CoreError::UpstreamUnavailable)?;
        Ok(ServiceResponse { status, headers: vec![], cache_status: CacheStatus::Bypass, body: ResponseBody::Buffered(body) })
    }

    /// `HEAD` on a manifest reference: serves from the cache when present,
    /// otherwise relays a bare upstream `HEAD` without ever writing the
    /// descriptor index or the manifest store (HEAD never admits to cache).
    pub async fn head_manifest(
        &self,
        upstream: &str,
        repository: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> Result<ServiceResponse, CoreError> {
        let key = ManifestKey::new(repository, reference);
        if self.cache_enabled {
            if let Some(entry) = self.manifests.get(&key).await? {
                self.stats.record_manifest_hit();
                return Ok(cached_entry_response(entry, CacheStatus::Hit));
            }
        }
        self.stats.record_manifest_miss();

        let path = format!("/v2/{repository}/manifests/{reference}");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(reqwest::header::ACCEPT, accept.parse().unwrap());
        }
        let req = build_upstream_request(&self.client, Method::HEAD, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status().as_u16();
        let headers_out = filter_headers(resp.headers())
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        Ok(ServiceResponse { status, headers: headers_out, cache_status: CacheStatus::Bypass, body: ResponseBody::Buffered(Bytes::new()) })
    }

    /// Cache-aside blob fetch, coalesced on digest. Large bodies stream
    /// straight through with `X-Cache: BYPASS`; small bodies are teed into
    /// the blob CAS as they're relayed to the client.
    pub async fn get_blob(&self, upstream: &str, repository: &str, digest: &str) -> Result<ServiceResponse, CoreError> {
        if self.cache_enabled {
            if let Some(record) = self.blobs.stat(digest).await? {
                if let Some(stream) = self.blobs.get(digest).await? {
                    self.stats.record_blob_hit();
                    let mapped: ServiceStream = Box::pin(stream.map(|r| r.map_err(CoreError::from)));
                    return Ok(ServiceResponse {
                        status: 200,
                        headers: vec![
                            ("docker-content-digest".to_string(), record.digest.clone()),
                            (
                                "content-type".to_string(),
                                record.media_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
                            ),
                        ],
                        cache_status: CacheStatus::Hit,
                        body: ResponseBody::Streamed(mapped),
                    });
                }
            }
        }
        self.stats.record_blob_miss();

        let coalesce_key = format!("blob:{digest}");
        match self.coalescer.try_start(&coalesce_key) {
            TryStart::First(first) => {
                let result = self.fetch_and_cache_blob(upstream, repository, digest).await;
                first.done(result.as_ref().err().map(|e| e.to_string()));
                result
            }
            TryStart::Follower(follower) => {
                self.stats.record_dedup();
                let cancel = std::future::pending::<()>();
                if follower.wait(cancel).await.is_ok() {
                    if let Some(stream) = self.blobs.get(digest).await? {
                        let mapped: ServiceStream = Box::pin(stream.map(|r| r.map_err(CoreError::from)));
                        return Ok(ServiceResponse {
                            status: 200,
                            headers: vec![("docker-content-digest".to_string(), digest.to_string())],
                            cache_status: CacheStatus::Hit,
                            body: ResponseBody::Streamed(mapped),
                        });
                    }
                }
                self.direct_blob_fetch(upstream, repository, digest).await
            }
        }
    }

    async fn fetch_and_cache_blob(&self, upstream: &str, repository: &str, digest: &str) -> Result<ServiceResponse, CoreError> {
        let path = format!("/v2/{repository}/blobs/{digest}");
        let headers = reqwest::header::HeaderMap::new();
        let req = build_upstream_request(&self.client, Method::GET, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status();

        if status.is_redirection() {
            return self.follow_redirect_for_blob(resp, digest).await;
        }
        if status != StatusCode::OK {
            let body = resp.bytes().await.unwrap_or_default().to_vec();
            return Err(CoreError::UpstreamStatus { status: status.as_u16(), body });
        }

        let content_length = resp.content_length();
        let media_type = resp.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);

        if !self.cache_enabled || !classify_admission(200, content_length) {
            let stream: ServiceStream = Box::pin(
                resp.bytes_stream().map(|r| r.map_err(CoreError::UpstreamUnavailable)),
            );
            return Ok(ServiceResponse {
                status: 200,
                headers: vec![("docker-content-digest".to_string(), digest.to_string())],
                cache_status: CacheStatus::Bypass,
                body: ResponseBody::Streamed(stream),
            });
        }

        let digest_owned = digest.to_string();
        let blobs = self.blobs.clone();
        let (client_stream, cache_handle) = tee_for_cache(resp.bytes_stream());
        tokio::spawn(async move {
            if let Some(bytes) = cache_handle.await.unwrap_or(None) {
                let body = futures::stream::once(async move { Ok::<_, regcache_store::StoreError>(bytes) });
                if let Err(err) = blobs.put(&digest_owned, media_type, Box::pin(body)).await {
                    debug!(%err, digest = %digest_owned, "async cache admission failed");
                } else {
                    info!(digest = %digest_owned, "blob admitted to cache");
                }
            }
        });

        let mapped: ServiceStream = Box::pin(client_stream.map(|r| r.map_err(CoreError::from)));
        Ok(ServiceResponse {
            status: 200,
            headers: vec![("docker-content-digest".to_string(), digest.to_string())],
            cache_status: CacheStatus::Miss,
            body: ResponseBody::Streamed(mapped),
        })
    }

    async fn follow_redirect_for_blob(&self, mut resp: reqwest::Response, digest: &str) -> Result<ServiceResponse, CoreError> {
        let mut hops = 0u32;
        loop {
            let location = resp.headers().get(reqwest::header::LOCATION).and_then(|v| v.to_str().ok()).map(str::to_string);
            let Some(location) = location else {
                let status = resp.status().as_u16();
                let stream: ServiceStream = Box::pin(resp.bytes_stream().map(|r| r.map_err(CoreError::UpstreamUnavailable)));
                return Ok(ServiceResponse { status, headers: vec![], cache_status: CacheStatus::Bypass, body: ResponseBody::Streamed(stream) });
            };

            match self.classifier.classify(&location) {
                RedirectDecision::RelayToClient => {
                    return Ok(ServiceResponse {
                        status: resp.status().as_u16(),
                        headers: vec![("location".to_string(), location)],
                        cache_status: CacheStatus::Bypass,
                        body: ResponseBody::Buffered(Bytes::new()),
                    });
                }
                RedirectDecision::FollowServerSide => {
                    hops += 1;
                    if hops > MAX_SERVER_SIDE_REDIRECTS {
                        return Err(CoreError::RedirectLoop(MAX_SERVER_SIDE_REDIRECTS));
                    }
                    // carries only Accept/Range forward; no Authorization (signed URL self-validates).
                    let next = self
                        .client
                        .get(&location)
                        .header(reqwest::header::USER_AGENT, "regcache/1.0")
                        .send()
                        .await
                        .map_err(CoreError::UpstreamUnavailable)?;
                    if next.status().is_redirection() {
                        resp = next;
                        continue;
                    }
                    if !next.status().is_success() {
                        let status = next.status().as_u16();
                        let body = next.bytes().await.unwrap_or_default();
                        return Ok(ServiceResponse { status, headers: vec![], cache_status: CacheStatus::Bypass, body: ResponseBody::Buffered(body) });
                    }
                    let content_length = next.content_length();
                    let media_type = next.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
                    if !self.cache_enabled || !classify_admission(200, content_length) {
                        let stream: ServiceStream = Box::pin(next.bytes_stream().map(|r| r.map_err(CoreError::UpstreamUnavailable)));
                        return Ok(ServiceResponse {
                            status: 200,
                            headers: vec![("docker-content-digest".to_string(), digest.to_string())],
                            cache_status: CacheStatus::Bypass,
                            body: ResponseBody::Streamed(stream),
                        });
                    }
                    let digest_owned = digest.to_string();
                    let blobs = self.blobs.clone();
                    let (client_stream, cache_handle) = tee_for_cache(next.bytes_stream());
                    tokio::spawn(async move {
                        if let Some(bytes) = cache_handle.await.unwrap_or(None) {
                            let body = futures::stream::once(async move { Ok::<_, regcache_store::StoreError>(bytes) });
                            blobs.put(&digest_owned, media_type, Box::pin(body)).await.ok();
                        }
                    });
                    let mapped: ServiceStream = Box::pin(client_stream.map(|r| r.map_err(CoreError::from)));
                    return Ok(ServiceResponse {
                        status: 200,
                        headers: vec![("docker-content-digest".to_string(), digest.to_string())],
                        cache_status: CacheStatus::Miss,
                        body: ResponseBody::Streamed(mapped),
                    });
                }
            }
        }
    }

    async fn direct_blob_fetch(&self, upstream: &str, repository: &str, digest: &str) -> Result<ServiceResponse, CoreError> {
        let path = format!("/v2/{repository}/blobs/{digest}");
        let headers = reqwest::header::HeaderMap::new();
        let req = build_upstream_request(&self.client, Method::GET, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status().as_u16();
        let stream: ServiceStream = Box::pin(resp.bytes_stream().map(|r| r.map_err(CoreError::UpstreamUnavailable)));
        Ok(ServiceResponse { status, headers: vec![], cache_status: CacheStatus::Bypass, body: ResponseBody::Streamed(stream) })
    }

    /// `HEAD` on a blob digest: answers from the descriptor/blob metadata
    /// when known, otherwise relays a bare upstream `HEAD`. Never triggers
    /// a fetch-and-admit cycle.
    pub async fn head_blob(&self, upstream: &str, repository: &str, digest: &str) -> Result<ServiceResponse, CoreError> {
        if self.cache_enabled {
            if let Some(record) = self.blobs.stat(digest).await? {
                self.stats.record_blob_hit();
                return Ok(ServiceResponse {
                    status: 200,
                    headers: vec![
                        ("docker-content-digest".to_string(), record.digest.clone()),
                        ("content-length".to_string(), record.size.to_string()),
                        (
                            "content-type".to_string(),
                            record.media_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
                        ),
                    ],
                    cache_status: CacheStatus::Hit,
                    body: ResponseBody::Buffered(Bytes::new()),
                });
            }
        }
        self.stats.record_blob_miss();

        let path = format!("/v2/{repository}/blobs/{digest}");
        let headers = reqwest::header::HeaderMap::new();
        let req = build_upstream_request(&self.client, Method::HEAD, upstream, &path, &headers);
        let resp = req.send().await.map_err(CoreError::UpstreamUnavailable)?;
        let status = resp.status().as_u16();
        let headers_out = filter_headers(resp.headers())
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        Ok(ServiceResponse { status, headers: headers_out, cache_status: CacheStatus::Bypass, body: ResponseBody::Buffered(Bytes::new()) })
    }
}

fn cached_entry_response(entry: CacheEntry, cache_status: CacheStatus) -> ServiceResponse {
    ServiceResponse {
        status: entry.status_code,
        headers: entry.headers,
        cache_status,
        body: ResponseBody::Buffered(entry.data.map(Bytes::from).unwrap_or_default()),
    }
}

/// Default descriptor-index TTL: on the order of 24 hours.
pub const DESCRIPTOR_INDEX_TTL: Duration = Duration::from_secs(24 * 3600);
/// Default manifest tag TTL: on the order of 24 hours.
pub const DEFAULT_MANIFEST_TAG_TTL: ChronoDuration = ChronoDuration::hours(24);
/// Default manifest digest TTL: on the order of 1 year.
pub const DEFAULT_MANIFEST_DIGEST_TTL: ChronoDuration = ChronoDuration::days(365);
/// Default blob TTL (sidecar `expiresAt`): mirrors the manifest digest TTL.
pub const DEFAULT_BLOB_TTL: ChronoDuration = ChronoDuration::days(365);
