//! Application state shared across handlers: a struct of cheaply-cloneable
//! `Arc`s plumbed through axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use regcache_core::service::ProxyService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProxyService>,
    pub started_at: Instant,
    pub custom_domain: String,
    pub debug: bool,
}

impl AppState {
    pub fn new(service: Arc<ProxyService>, custom_domain: String, debug: bool) -> Self {
        Self { service, started_at: Instant::now(), custom_domain, debug }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
