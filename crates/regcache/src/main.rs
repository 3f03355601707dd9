//! Process bootstrap: CLI parsing, logging, component wiring, graceful
//! shutdown. Wiring order is storage, then service, then router, matching
//! the two-store, multi-upstream shape this proxy needs.

mod config;
mod healthcheck;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use regcache_api::AppState;
use regcache_core::coalesce::Coalescer;
use regcache_core::redirect::RedirectClassifier;
use regcache_core::router::Router as HostRouter;
use regcache_core::service::{ProxyService, DESCRIPTOR_INDEX_TTL};
use regcache_core::stats::Stats;
use regcache_store::{maintenance, BlobStore, DescriptorIndex, ManifestStore};

#[derive(Parser, Debug)]
#[command(name = "regcache", about = "caching reverse proxy for OCI/Docker registries")]
struct Args {
    /// Performs an in-process probe of /health and exits non-zero on failure.
    #[arg(long = "health-check")]
    health_check: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).with(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::Config::from_env();

    if args.health_check {
        let ok = healthcheck::run(cfg.port).await;
        std::process::exit(if ok { 0 } else { 1 });
    }

    init_logging(cfg.debug);
    info!(port = cfg.port, cache_dir = %cfg.cache_dir, "starting regcache");

    // DNS override plumbing is firewall/kernel territory, not this binary's
    // job; a requested override is logged and the system resolver is used.
    let mut client_builder = reqwest::Client::builder();
    if cfg.dns_enabled && !cfg.dns_servers.is_empty() {
        info!(servers = ?cfg.dns_servers, "custom DNS servers requested but not applied; falling back to the system resolver");
    }
    client_builder = client_builder.timeout(cfg.dns_timeout.max(Duration::from_secs(5)) + Duration::from_secs(25));
    let client = client_builder.build()?;

    let blob_root = format!("{}/blobs", cfg.cache_dir);
    let manifest_root = format!("{}/manifests", cfg.cache_dir);
    tokio::fs::create_dir_all(&blob_root).await?;
    tokio::fs::create_dir_all(&manifest_root).await?;
    tokio::fs::create_dir_all(format!("{}/tmp", cfg.cache_dir)).await?;

    let descriptor_index = Arc::new(DescriptorIndex::new(100_000, DESCRIPTOR_INDEX_TTL));
    let blobs = Arc::new(BlobStore::new(blob_root, descriptor_index.clone(), cfg.blob_ttl));
    let manifests = Arc::new(ManifestStore::new(manifest_root, cfg.manifest_tag_ttl, cfg.manifest_digest_ttl));

    // Startup index rebuild runs on its own task so the server can start
    // accepting connections immediately; hit rate climbs as it completes.
    {
        let blobs = blobs.clone();
        let manifests = manifests.clone();
        tokio::task::spawn(async move {
            match blobs.load_index().await {
                Ok((count, size)) => info!(count, size, "blob index loaded"),
                Err(err) => tracing::warn!(%err, "blob index load failed"),
            }
            match manifests.load_index().await {
                Ok(count) => info!(count, "manifest index loaded"),
                Err(err) => tracing::warn!(%err, "manifest index load failed"),
            }
        });
    }

    let service = Arc::new(ProxyService {
        router: HostRouter::new(&cfg.custom_domain, cfg.target_upstream.clone()),
        client,
        classifier: RedirectClassifier::new(cfg.blocked_hosts.clone(), cfg.follow_all_redirects),
        coalescer: Coalescer::new(),
        stats: Arc::new(Stats::new()),
        blobs: blobs.clone(),
        manifests: manifests.clone(),
        cache_enabled: cfg.cache_enabled,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let last_cleanup = Arc::new(maintenance::LastCleanup::new());
    let maintenance_handle = maintenance::spawn_maintenance(
        blobs.clone(),
        manifests.clone(),
        last_cleanup.clone(),
        10 * 1024 * 1024 * 1024,
        Duration::from_secs(30 * 60),
        shutdown_rx,
    );

    let state = AppState::new(service, cfg.custom_domain.clone(), cfg.debug);
    let app = regcache_api::create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    shutdown_tx.send(true).ok();
    let _ = tokio::time::timeout(Duration::from_secs(15), maintenance_handle).await;
    info!("regcache stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
}
