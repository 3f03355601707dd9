//! Core error taxonomy. Each variant carries its own HTTP surfacing
//! policy, applied at the API edge rather than here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] regcache_store::StoreError),

    #[error("no route configured for host {0}")]
    RouteNotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redirect loop: exceeded {0} hops")]
    RedirectLoop(u32),

    #[error("bad auth challenge from upstream: {0}")]
    BadAuthChallenge(String),

    #[error("cache miss")]
    CacheMiss,

    #[error("request cancelled")]
    ContextCancelled,

    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16, body: Vec<u8> },
}
