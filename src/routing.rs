//! Application router configuration.

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::json;

use crate::{
    AppState, endpoints, logging::logging_middleware, sync::trigger_sync_endpoint,
    webhook::receive_webhook_endpoint,
};

/// Return a router with all the app's routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(get_health))
        .route(endpoints::SYNC, post(trigger_sync_endpoint))
        .route(
            endpoints::AGGREGATOR_WEBHOOK,
            post(receive_webhook_endpoint),
        )
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state)
}

/// Liveness check.
async fn get_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
