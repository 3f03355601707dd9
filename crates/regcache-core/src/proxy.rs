//! Streaming proxy pipeline.
//!
//! Builds the upstream request, strips hop-by-hop headers in both
//! directions, and streams the body back to the client with a bounded-size
//! tee into memory for cache admission: one branch feeds the client
//! response body, the other accumulates bytes for the async cache write.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use tracing::warn;

use crate::error::CoreError;

/// Headers that apply to a single transport hop and must never be forwarded.
pub const HOP_BY_HOP: &[&str] =
    &["connection", "proxy-connection", "upgrade", "host", "content-length", "transfer-encoding"];

/// Bodies at or above this size bypass the in-memory cache-admission path
/// and stream straight through.
pub const LARGE_OBJECT_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Read/flush chunk size used when relaying a body to the client.
pub const STREAM_CHUNK_HINT: usize = 256 * 1024;

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

pub fn filter_headers(src: &HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    src.iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Builds the outbound request to `upstream_base + path` (query included in
/// `path`), copying the client's headers minus hop-by-hop ones and setting
/// `Host`/`User-Agent` explicitly.
pub fn build_upstream_request(
    client: &Client,
    method: Method,
    upstream_base: &str,
    path_and_query: &str,
    client_headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    let url = format!("{}{}", upstream_base.trim_end_matches('/'), path_and_query);
    let mut req = client.request(method, url);
    for (name, value) in filter_headers(client_headers) {
        req = req.header(name, value);
    }
    req = req.header(reqwest::header::USER_AGENT, "regcache/1.0");
    req
}

pub enum CacheAdmission {
    /// Response is small enough to buffer and admit to cache.
    Admit { status: u16, headers: Vec<(String, String)>, body: Bytes },
    /// Response bypasses the cache and streams straight through.
    Bypass,
}

/// Decides cache admission for a `GET` 200 response based on declared
/// `Content-Length`. Does not itself read the body.
pub fn classify_admission(status: u16, content_length: Option<u64>) -> bool {
    status == 200 && matches!(content_length, Some(len) if len < LARGE_OBJECT_THRESHOLD)
}

/// Buffers an upstream response body fully into memory. Only called once
/// `classify_admission` has already approved the size.
pub async fn buffer_body(response: Response) -> Result<Bytes, CoreError> {
    response.bytes().await.map_err(CoreError::UpstreamUnavailable)
}

/// Converts an upstream response into a client-facing byte stream without
/// buffering, for the bypass / large-object path.
pub fn passthrough_stream(response: Response) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    response.bytes_stream().map(|r| r.map_err(|e| std::io::Error::other(e)))
}

/// Tees a response stream into a client-facing stream and a background task
/// that accumulates the full body for cache admission, capped at
/// `LARGE_OBJECT_THRESHOLD` (overflow aborts the cache branch but never the
/// client branch).
pub fn tee_for_cache(
    mut source: impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
) -> (impl Stream<Item = Result<Bytes, std::io::Error>>, tokio::task::JoinHandle<Option<Bytes>>) {
    let (client_tx, client_rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let (cache_tx, mut cache_rx) = tokio::sync::mpsc::channel::<Bytes>(8);

    tokio::spawn(async move {
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    if cache_tx.send(bytes.clone()).await.is_err() {
                        // cache branch gave up (e.g. overflow); keep serving the client.
                    }
                    if client_tx.send(Ok(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = client_tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
    });

    let cache_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        while let Some(chunk) = cache_rx.recv().await {
            if buf.len() as u64 + chunk.len() as u64 > LARGE_OBJECT_THRESHOLD {
                warn!("cache tee exceeded large-object threshold, dropping cache admission");
                return None;
            }
            buf.extend_from_slice(&chunk);
        }
        Some(Bytes::from(buf))
    });

    (tokio_stream_from_receiver(client_rx), cache_handle)
}

fn tokio_stream_from_receiver(
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn admission_requires_small_known_length() {
        assert!(classify_admission(200, Some(10)));
        assert!(!classify_admission(200, Some(LARGE_OBJECT_THRESHOLD)));
        assert!(!classify_admission(200, None));
        assert!(!classify_admission(404, Some(10)));
    }

    #[tokio::test]
    async fn tee_duplicates_bytes_to_both_branches() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let source = futures::stream::iter(chunks);
        let (mut client_stream, cache_handle) = tee_for_cache(source);

        let mut collected = Vec::new();
        while let Some(chunk) = client_stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");

        let cached = cache_handle.await.unwrap().unwrap();
        assert_eq!(&cached[..], b"hello world");
    }
}
