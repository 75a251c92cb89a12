//! Route handler for triggering a workspace sync.

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
use serde_json::json;
use time::{Date, OffsetDateTime};

use crate::{
    AppState,
    aggregator::BankDataProvider,
    database_id::WorkspaceId,
    sync::{SyncContext, SyncWindow, sync_workspace},
    token::TokenCipher,
};

/// The state needed for triggering a sync.
#[derive(Clone)]
pub struct SyncState {
    /// The database connection holding the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
    /// Decrypts stored access tokens.
    pub token_cipher: TokenCipher,
    /// The banking-data provider.
    pub bank_data: Arc<dyn BankDataProvider>,
    /// The bounded wait after a best-effort refresh trigger.
    pub refresh_settle_delay: Duration,
}

impl FromRef<AppState> for SyncState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            token_cipher: state.token_cipher.clone(),
            bank_data: state.bank_data.clone(),
            refresh_settle_delay: state.refresh_settle_delay,
        }
    }
}

/// The body of a sync trigger request.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// The workspace whose institutions should sync.
    pub workspace_id: WorkspaceId,
    /// Override for the start of the fetch window.
    #[serde(default)]
    pub start_date: Option<Date>,
    /// Override for the end of the fetch window.
    #[serde(default)]
    pub end_date: Option<Date>,
}

/// Route handler for running a sync over every institution in a workspace.
///
/// Responds 200 with the aggregate summary even when nothing synced (zero
/// linked institutions report `success: false` with a message), and 400 with
/// `{error, details}` on malformed input.
pub async fn trigger_sync_endpoint(
    State(state): State<SyncState>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid sync request",
                    "details": rejection.body_text(),
                })),
            )
                .into_response();
        }
    };

    let today = OffsetDateTime::now_utc().date();
    let window = match SyncWindow::from_bounds(request.start_date, request.end_date, today) {
        Ok(window) => window,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": error.to_string(),
                    "details": "start_date must not be after end_date",
                })),
            )
                .into_response();
        }
    };

    tracing::info!(
        "sync requested for workspace {} over {} to {}",
        request.workspace_id,
        window.start_date,
        window.end_date
    );

    let context = SyncContext {
        db_connection: &state.db_connection,
        token_cipher: &state.token_cipher,
        bank_data: state.bank_data.as_ref(),
        refresh_settle_delay: state.refresh_settle_delay,
    };

    match sync_workspace(request.workspace_id, window, &context).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(error) => error.into_response(),
    }
}
