//! Banklink is a server that links bank accounts through a banking-data
//! aggregator, ingests transaction feeds and reconciles them into a
//! per-workspace ledger.
//!
//! This library provides the ingestion pipeline: webhook handling, sync
//! orchestration, and the idempotent reconciliation of provider transactions
//! and balances against the SQLite ledger.

#![warn(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_server::Handle;
use serde_json::json;
use tokio::signal;

pub mod account;
pub mod aggregator;
mod app_state;
pub mod database_id;
mod db;
mod endpoints;
pub mod institution;
mod logging;
mod routing;
pub mod sync;
#[cfg(test)]
mod test_utils;
pub mod token;
pub mod transaction;
pub mod webhook;

pub use aggregator::{
    AggregatorClient, AggregatorEnv, AggregatorError, BankDataProvider, ProviderAccount,
    ProviderBalances, ProviderInstitution, ProviderLocation, ProviderTransaction,
};
pub use app_state::AppState;
pub use db::initialize as initialize_db;
pub use logging::{LOG_BODY_LENGTH_LIMIT, logging_middleware};
pub use routing::build_router;
pub use token::{DecryptStrategy, DecryptedToken, TokenCipher};

/// An async task that waits for either the ctrl+c or terminate signal,
/// whichever comes first, and then signals the server to shut down gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle<SocketAddr>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The requested resource was not found.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// The provider item id on an institution row already exists.
    ///
    /// Each aggregator item maps to exactly one institution row, so a second
    /// link attempt for the same item must be rejected rather than creating a
    /// parallel connection.
    #[error("an institution with this provider item id already exists")]
    DuplicateProviderItem,

    /// The provider account id already exists within the workspace.
    ///
    /// Accounts are created once at link time. A duplicate here means the
    /// linking subsystem replayed an account creation.
    #[error("an account with this provider account id already exists in the workspace")]
    DuplicateProviderAccount,

    /// A row referenced an institution that does not exist.
    ///
    /// A bank account must always point at a real institution row. Hitting
    /// this error means the caller tried to create an account before its
    /// institution, which indicates a partial-creation bug upstream.
    #[error("the institution id does not refer to a valid institution")]
    InvalidInstitution,

    /// A stored connection status string did not match any known status.
    ///
    /// This indicates data corruption or a schema migration gap, not a caller
    /// mistake.
    #[error("\"{0}\" is not a valid connection status")]
    InvalidConnectionStatus(String),

    /// The caller supplied a sync window whose start date is after its end
    /// date.
    #[error("invalid sync window: {0}")]
    InvalidSyncWindow(String),

    /// Could not acquire the database lock.
    #[error("could not acquire the database lock")]
    DatabaseLockError,

    /// The token cipher could not encrypt a credential.
    ///
    /// The error string should only be logged for debugging on the server,
    /// never sent to a client.
    #[error("token encryption failed: {0}")]
    TokenEncryption(String),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Error::InvalidSyncWindow(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::DuplicateProviderItem | Error::DuplicateProviderAccount => {
                (StatusCode::CONFLICT, self.to_string())
            }
            // Any errors that are not handled above are not intended to be
            // shown to the client.
            error => {
                tracing::error!("An unexpected error occurred: {}", error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error occurred".to_owned(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
