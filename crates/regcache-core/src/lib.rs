//! Registry-aware HTTP proxy engine: routing, auth brokering, Docker Hub
//! path rewriting, redirect classification, the streaming response
//! pipeline, request coalescing, and statistics.

pub mod auth;
pub mod coalesce;
pub mod error;
pub mod proxy;
pub mod redirect;
pub mod rewrite;
pub mod router;
pub mod service;
pub mod stats;

pub use coalesce::Coalescer;
pub use error::CoreError;
pub use redirect::RedirectClassifier;
pub use router::Router;
pub use stats::Stats;
