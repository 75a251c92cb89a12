//! The API endpoint URIs.

/// The route for the liveness check.
pub const HEALTH: &str = "/api/health";
/// The route for triggering a workspace sync.
pub const SYNC: &str = "/api/sync";
/// The route the aggregator delivers webhook events to.
pub const AGGREGATOR_WEBHOOK: &str = "/api/webhooks/aggregator";
