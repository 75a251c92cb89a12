//! Defines the audit log for inbound webhook events.
//!
//! Every webhook payload is recorded before it is acted on, including events
//! the dispatcher does not recognize. Rows are insert-only and never mutated,
//! so the log is a faithful record of what the aggregator delivered.

use rusqlite::{Connection, Row};
use time::OffsetDateTime;

use crate::{Error, database_id::DatabaseId};

/// An immutable record of one inbound webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// The id for the audit row.
    pub id: DatabaseId,
    /// The webhook's type field, e.g. "TRANSACTIONS".
    pub webhook_type: String,
    /// The webhook's code field, e.g. "SYNC_UPDATES_AVAILABLE".
    pub webhook_code: String,
    /// The aggregator item the event refers to, when present.
    pub provider_item_id: Option<String>,
    /// The raw payload JSON as delivered.
    pub payload: String,
    /// When the event was received.
    pub received_at: OffsetDateTime,
}

/// Create the webhook event table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_webhook_event_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS webhook_event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_type TEXT NOT NULL,
                webhook_code TEXT NOT NULL,
                provider_item_id TEXT,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL
                )",
        (),
    )?;

    Ok(())
}

/// Map a database row to a [WebhookEvent].
pub fn map_webhook_event_row(row: &Row) -> Result<WebhookEvent, rusqlite::Error> {
    Ok(WebhookEvent {
        id: row.get(0)?,
        webhook_type: row.get(1)?,
        webhook_code: row.get(2)?,
        provider_item_id: row.get(3)?,
        payload: row.get(4)?,
        received_at: row.get(5)?,
    })
}

/// Record an inbound webhook payload for audit.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn record_webhook_event(
    webhook_type: &str,
    webhook_code: &str,
    provider_item_id: Option<&str>,
    payload: &str,
    received_at: OffsetDateTime,
    connection: &Connection,
) -> Result<WebhookEvent, Error> {
    let event = connection
        .prepare(
            "INSERT INTO webhook_event
                 (webhook_type, webhook_code, provider_item_id, payload, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id, webhook_type, webhook_code, provider_item_id, payload, received_at",
        )?
        .query_row(
            (
                webhook_type,
                webhook_code,
                provider_item_id,
                payload,
                received_at,
            ),
            map_webhook_event_row,
        )?;

    Ok(event)
}

/// Get the total number of recorded webhook events.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn count_webhook_events(connection: &Connection) -> Result<u32, Error> {
    connection
        .query_row("SELECT COUNT(id) FROM webhook_event", [], |row| row.get(0))
        .map_err(Error::from)
}

#[cfg(test)]
mod database_tests {
    use rusqlite::Connection;
    use time::OffsetDateTime;

    use crate::{
        db::initialize,
        webhook::{count_webhook_events, record_webhook_event},
    };

    fn get_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn
    }

    #[test]
    fn records_event_with_item_id() {
        let conn = get_test_connection();
        let received_at = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();

        let event = record_webhook_event(
            "TRANSACTIONS",
            "SYNC_UPDATES_AVAILABLE",
            Some("item-1"),
            r#"{"webhook_type":"TRANSACTIONS"}"#,
            received_at,
            &conn,
        )
        .unwrap();

        assert!(event.id > 0);
        assert_eq!(event.webhook_type, "TRANSACTIONS");
        assert_eq!(event.provider_item_id.as_deref(), Some("item-1"));
        assert_eq!(event.received_at, received_at);
    }

    #[test]
    fn records_event_without_item_id() {
        let conn = get_test_connection();
        let received_at = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();

        let event = record_webhook_event(
            "ITEM",
            "SOME_FUTURE_CODE",
            None,
            r#"{"webhook_type":"ITEM"}"#,
            received_at,
            &conn,
        )
        .unwrap();

        assert_eq!(event.provider_item_id, None);
        assert_eq!(count_webhook_events(&conn).unwrap(), 1);
    }
}
