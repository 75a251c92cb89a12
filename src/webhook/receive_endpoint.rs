//! Route handler for inbound aggregator webhooks.
//!
//! The aggregator delivers at least once and retries on any non-2xx
//! response, so 2xx is returned for every handled-or-ignored event and
//! non-2xx is reserved for genuine processing failures. Correctness under
//! redelivery comes from the handlers being idempotent, not from suppressing
//! duplicates.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json,
    extract::{FromRef, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{
    AppState, Error,
    aggregator::BankDataProvider,
    institution::{
        ConnectionStatus, Institution, get_institution_by_item_id, record_institution_error,
        set_institution_status,
    },
    sync::{SyncContext, SyncWindow, sync_institutions},
    token::TokenCipher,
    transaction::remove_transaction,
    webhook::record_webhook_event,
};

/// The state needed for handling webhook events.
#[derive(Clone)]
pub struct WebhookState {
    /// The database connection holding the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
    /// Decrypts stored access tokens.
    pub token_cipher: TokenCipher,
    /// The banking-data provider.
    pub bank_data: Arc<dyn BankDataProvider>,
    /// The bounded wait after a best-effort refresh trigger.
    pub refresh_settle_delay: Duration,
}

impl FromRef<AppState> for WebhookState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            token_cipher: state.token_cipher.clone(),
            bank_data: state.bank_data.clone(),
            refresh_settle_delay: state.refresh_settle_delay,
        }
    }
}

/// The fields the dispatcher reads from a webhook body.
#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    webhook_type: Option<String>,
    #[serde(default)]
    webhook_code: Option<String>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    removed_transactions: Option<Vec<String>>,
    #[serde(default)]
    error: Option<Value>,
}

/// Route handler for inbound aggregator webhook events.
///
/// Every event is recorded for audit before dispatch, including events with
/// unknown `(webhook_type, webhook_code)` pairs, which are acknowledged with
/// 200 so the aggregator does not retry them forever.
pub async fn receive_webhook_endpoint(
    State(state): State<WebhookState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(raw_payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    let event: WebhookPayload = match serde_json::from_value(raw_payload.clone()) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!("webhook payload has unexpected field types: {error}");
            WebhookPayload::default()
        }
    };

    let webhook_type = event.webhook_type.as_deref().unwrap_or("UNKNOWN");
    let webhook_code = event.webhook_code.as_deref().unwrap_or("UNKNOWN");

    // The audit row is written before any mutation so the log is complete
    // even when dispatch fails part way.
    {
        let Ok(connection) = state.db_connection.lock() else {
            return internal_error("could not acquire the database lock");
        };

        let recorded = record_webhook_event(
            webhook_type,
            webhook_code,
            event.item_id.as_deref(),
            &raw_payload.to_string(),
            OffsetDateTime::now_utc(),
            &connection,
        );

        if let Err(error) = recorded {
            tracing::error!("could not record webhook event: {error}");
            return internal_error("could not record webhook event");
        }
    }

    tracing::info!(
        "webhook received: {webhook_type}/{webhook_code} for item {:?}",
        event.item_id
    );

    match (webhook_type, webhook_code) {
        (
            "TRANSACTIONS",
            "SYNC_UPDATES_AVAILABLE" | "DEFAULT_UPDATE" | "INITIAL_UPDATE" | "HISTORICAL_UPDATE",
        ) => handle_transactions_update(&state, event.item_id.as_deref()).await,
        ("TRANSACTIONS", "TRANSACTIONS_REMOVED") => handle_transactions_removed(
            &state,
            event.item_id.as_deref(),
            event.removed_transactions.as_deref().unwrap_or(&[]),
        ),
        ("ITEM", "ERROR") => handle_item_error(&state, event.item_id.as_deref(), event.error),
        ("ITEM", "PENDING_EXPIRATION") => handle_status_transition(
            &state,
            event.item_id.as_deref(),
            ConnectionStatus::PendingExpiration,
        ),
        ("ITEM", "USER_PERMISSION_REVOKED") => handle_status_transition(
            &state,
            event.item_id.as_deref(),
            ConnectionStatus::Disconnected,
        ),
        ("ITEM", "WEBHOOK_UPDATE_ACKNOWLEDGED") => success_response(),
        (other_type, other_code) => {
            tracing::info!("webhook {other_type}/{other_code} is not handled, audited only");
            success_response()
        }
    }
}

fn success_response() -> Response {
    Json(json!({ "success": true })).into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

/// Resolve the institution a webhook refers to.
///
/// Returns `Ok(None)` when the event carries no item id or the id matches no
/// institution; the resource may have been disconnected already, so this is a
/// logged drop, not an error response.
fn resolve_institution(
    item_id: Option<&str>,
    connection: &Connection,
) -> Result<Option<Institution>, Error> {
    let Some(item_id) = item_id else {
        tracing::warn!("webhook carries no item id, dropping");
        return Ok(None);
    };

    match get_institution_by_item_id(item_id, connection) {
        Ok(institution) => Ok(Some(institution)),
        Err(Error::NotFound) => {
            tracing::warn!("webhook item {item_id} resolves to no institution, dropping");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

async fn handle_transactions_update(state: &WebhookState, item_id: Option<&str>) -> Response {
    let institution = {
        let Ok(connection) = state.db_connection.lock() else {
            return internal_error("could not acquire the database lock");
        };

        match resolve_institution(item_id, &connection) {
            Ok(Some(institution)) => institution,
            Ok(None) => return success_response(),
            Err(error) => {
                tracing::error!("could not resolve webhook item: {error}");
                return internal_error("could not resolve webhook item");
            }
        }
    };

    let context = SyncContext {
        db_connection: &state.db_connection,
        token_cipher: &state.token_cipher,
        bank_data: state.bank_data.as_ref(),
        refresh_settle_delay: state.refresh_settle_delay,
    };

    let window = SyncWindow::default_for(OffsetDateTime::now_utc().date());
    let summary = sync_institutions(std::slice::from_ref(&institution), window, &context).await;

    tracing::info!(
        "webhook-triggered sync for institution {}: {} new, {} updated, {} errors",
        institution.id,
        summary.new_transactions,
        summary.updated_transactions,
        summary.errors
    );

    success_response()
}

fn handle_transactions_removed(
    state: &WebhookState,
    item_id: Option<&str>,
    removed_transaction_ids: &[String],
) -> Response {
    let Ok(connection) = state.db_connection.lock() else {
        return internal_error("could not acquire the database lock");
    };

    let institution = match resolve_institution(item_id, &connection) {
        Ok(Some(institution)) => institution,
        Ok(None) => return success_response(),
        Err(error) => {
            tracing::error!("could not resolve webhook item: {error}");
            return internal_error("could not resolve webhook item");
        }
    };

    let mut rows_deleted = 0;
    for provider_transaction_id in removed_transaction_ids {
        match remove_transaction(provider_transaction_id, institution.workspace_id, &connection) {
            Ok(rows_affected) => rows_deleted += rows_affected,
            Err(error) => {
                tracing::error!(
                    "could not remove transaction {provider_transaction_id}: {error}"
                );
                return internal_error("could not remove transactions");
            }
        }
    }

    tracing::info!(
        "removed {rows_deleted} of {} reported transactions for institution {}",
        removed_transaction_ids.len(),
        institution.id
    );

    success_response()
}

fn handle_item_error(
    state: &WebhookState,
    item_id: Option<&str>,
    error_payload: Option<Value>,
) -> Response {
    let Ok(connection) = state.db_connection.lock() else {
        return internal_error("could not acquire the database lock");
    };

    let institution = match resolve_institution(item_id, &connection) {
        Ok(Some(institution)) => institution,
        Ok(None) => return success_response(),
        Err(error) => {
            tracing::error!("could not resolve webhook item: {error}");
            return internal_error("could not resolve webhook item");
        }
    };

    let payload_text = error_payload
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_owned());

    if let Err(error) = record_institution_error(institution.id, &payload_text, &connection) {
        tracing::error!(
            "could not record error for institution {}: {error}",
            institution.id
        );
        return internal_error("could not record institution error");
    }

    success_response()
}

fn handle_status_transition(
    state: &WebhookState,
    item_id: Option<&str>,
    status: ConnectionStatus,
) -> Response {
    let Ok(connection) = state.db_connection.lock() else {
        return internal_error("could not acquire the database lock");
    };

    let institution = match resolve_institution(item_id, &connection) {
        Ok(Some(institution)) => institution,
        Ok(None) => return success_response(),
        Err(error) => {
            tracing::error!("could not resolve webhook item: {error}");
            return internal_error("could not resolve webhook item");
        }
    };

    if let Err(error) = set_institution_status(institution.id, status, &connection) {
        tracing::error!(
            "could not set status for institution {}: {error}",
            institution.id
        );
        return internal_error("could not update institution status");
    }

    success_response()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod endpoint_tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use axum_test::TestServer;
    use rusqlite::Connection;
    use serde_json::{Value, json};
    use time::macros::date;

    use crate::{
        AppState, build_router, endpoints,
        institution::{ConnectionStatus, get_institution_by_item_id},
        test_utils::{StubBankData, provider_transaction, seed_institution_with_account},
        token::TokenCipher,
        transaction::{TransactionUpsert, count_transactions_for_workspace, upsert_transaction},
        webhook::count_webhook_events,
    };

    fn create_test_server(bank_data: StubBankData) -> (TestServer, Arc<Mutex<Connection>>) {
        let db_connection = Connection::open_in_memory().unwrap();
        let cipher = TokenCipher::from_secret("test-secret");

        let state = AppState::new(db_connection, cipher, Arc::new(bank_data))
            .expect("Could not create app state")
            .with_refresh_settle_delay(Duration::ZERO);

        let db_handle = state.db_connection.clone();
        let server = TestServer::try_new(build_router(state)).expect("Could not create test server.");

        (server, db_handle)
    }

    fn seed_workspace(db_handle: &Mutex<Connection>, item_id: &str, token: &str) -> i64 {
        let connection = db_handle.lock().unwrap();
        let cipher = TokenCipher::from_secret("test-secret");
        seed_institution_with_account(&connection, &cipher, 1, item_id, "acc-1", token)
    }

    #[tokio::test]
    async fn permission_revoked_disconnects_only_the_target_institution() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        seed_workspace(&db_handle, "item-x", "token-x");
        {
            let connection = db_handle.lock().unwrap();
            let cipher = TokenCipher::from_secret("test-secret");
            seed_institution_with_account(&connection, &cipher, 2, "item-y", "acc-2", "token-y");
        }

        let response = server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "USER_PERMISSION_REVOKED",
                "item_id": "item-x",
            }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], json!(true));

        let connection = db_handle.lock().unwrap();
        let revoked = get_institution_by_item_id("item-x", &connection).unwrap();
        let untouched = get_institution_by_item_id("item-y", &connection).unwrap();
        assert_eq!(revoked.status, ConnectionStatus::Disconnected);
        assert_eq!(untouched.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn pending_expiration_updates_status() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        seed_workspace(&db_handle, "item-1", "token-a");

        server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "PENDING_EXPIRATION",
                "item_id": "item-1",
            }))
            .await
            .assert_status_ok();

        let connection = db_handle.lock().unwrap();
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.status, ConnectionStatus::PendingExpiration);
    }

    #[tokio::test]
    async fn item_error_records_the_upstream_payload() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        seed_workspace(&db_handle, "item-1", "token-a");

        server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "ERROR",
                "item_id": "item-1",
                "error": { "error_code": "ITEM_LOGIN_REQUIRED" },
            }))
            .await
            .assert_status_ok();

        let connection = db_handle.lock().unwrap();
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.status, ConnectionStatus::Error);
        assert!(
            institution
                .last_error
                .unwrap()
                .contains("ITEM_LOGIN_REQUIRED")
        );
    }

    #[tokio::test]
    async fn unknown_webhook_code_is_audited_and_acknowledged() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        seed_workspace(&db_handle, "item-1", "token-a");

        let response = server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "SOME_FUTURE_CODE",
                "item_id": "item-1",
            }))
            .await;

        response.assert_status_ok();
        let connection = db_handle.lock().unwrap();
        assert_eq!(count_webhook_events(&connection).unwrap(), 1);
        // No status mutation happened.
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn unresolvable_item_id_is_dropped_with_ok() {
        let (server, db_handle) = create_test_server(StubBankData::new());

        let response = server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "USER_PERMISSION_REVOKED",
                "item_id": "item-gone",
            }))
            .await;

        response.assert_status_ok();
        let connection = db_handle.lock().unwrap();
        assert_eq!(count_webhook_events(&connection).unwrap(), 1);
    }

    #[tokio::test]
    async fn acknowledged_update_is_audit_only() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        seed_workspace(&db_handle, "item-1", "token-a");

        server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "ITEM",
                "webhook_code": "WEBHOOK_UPDATE_ACKNOWLEDGED",
                "item_id": "item-1",
            }))
            .await
            .assert_status_ok();

        let connection = db_handle.lock().unwrap();
        assert_eq!(count_webhook_events(&connection).unwrap(), 1);
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn sync_updates_webhook_ingests_new_transactions() {
        let bank_data = StubBankData::new().with_transactions(
            "token-a",
            vec![provider_transaction("txn-1", "acc-1", 42.50, date!(2025 - 06 - 01))],
        );
        let (server, db_handle) = create_test_server(bank_data);
        seed_workspace(&db_handle, "item-1", "token-a");

        let response = server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&json!({
                "webhook_type": "TRANSACTIONS",
                "webhook_code": "SYNC_UPDATES_AVAILABLE",
                "item_id": "item-1",
                "new_transactions": 1,
            }))
            .await;

        response.assert_status_ok();
        let connection = db_handle.lock().unwrap();
        assert_eq!(count_transactions_for_workspace(1, &connection).unwrap(), 1);
    }

    #[tokio::test]
    async fn removed_transactions_webhook_deletes_rows_idempotently() {
        let (server, db_handle) = create_test_server(StubBankData::new());
        let _institution_id = seed_workspace(&db_handle, "item-1", "token-a");
        {
            let connection = db_handle.lock().unwrap();
            let account_id: i64 = connection
                .query_row("SELECT id FROM bank_account LIMIT 1", [], |row| row.get(0))
                .unwrap();
            upsert_transaction(
                &TransactionUpsert {
                    workspace_id: 1,
                    account_id,
                    provider_transaction_id: "txn-1".to_owned(),
                    amount_cents: 4250,
                    direction: crate::transaction::Direction::Outflow,
                    currency: None,
                    transaction_date: date!(2025 - 06 - 01),
                    authorized_date: None,
                    status: crate::transaction::TransactionStatus::Posted,
                    merchant_name: None,
                    description: None,
                    category: None,
                    location_city: None,
                    location_region: None,
                    location_country: None,
                },
                &connection,
            )
            .unwrap();
        }

        let removal = json!({
            "webhook_type": "TRANSACTIONS",
            "webhook_code": "TRANSACTIONS_REMOVED",
            "item_id": "item-1",
            "removed_transactions": ["txn-1"],
        });

        server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&removal)
            .await
            .assert_status_ok();

        {
            let connection = db_handle.lock().unwrap();
            assert_eq!(count_transactions_for_workspace(1, &connection).unwrap(), 0);
        }

        // Redelivery of the same event is a no-op, not an error.
        server
            .post(endpoints::AGGREGATOR_WEBHOOK)
            .json(&removal)
            .await
            .assert_status_ok();
    }
}
