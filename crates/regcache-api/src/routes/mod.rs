mod health;
mod registry;
mod stats;

use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new().merge(health::routes()).merge(stats::routes()).merge(registry::routes()).with_state(state)
}
