//! Inbound aggregator webhooks: audit logging and dispatch.

mod core;
mod receive_endpoint;

pub use core::{
    WebhookEvent, count_webhook_events, create_webhook_event_table, map_webhook_event_row,
    record_webhook_event,
};
pub use receive_endpoint::receive_webhook_endpoint;
