//! HTTP surface: axum router, application state, and error-to-response
//! mapping.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
