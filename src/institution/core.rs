//! Defines the core data model and database queries for institutions.

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{InstitutionId, WorkspaceId},
};

// ============================================================================
// MODELS
// ============================================================================

/// The connection state of a linked institution.
///
/// Created as `Active` on a successful link exchange; later transitions are
/// driven by aggregator webhook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The connection is healthy and syncing.
    Active,
    /// The aggregator reported an item error; syncs will fail until re-link.
    Error,
    /// The access credential is about to expire and needs user attention.
    PendingExpiration,
    /// The user revoked access; the connection is dead.
    Disconnected,
}

impl ConnectionStatus {
    /// The status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::PendingExpiration => "pending_expiration",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    /// Parse a stored status string.
    ///
    /// # Errors
    /// Returns [Error::InvalidConnectionStatus] for strings that do not match
    /// any known status, which indicates corrupt data rather than bad input.
    pub fn parse(text: &str) -> Result<Self, Error> {
        match text {
            "active" => Ok(ConnectionStatus::Active),
            "error" => Ok(ConnectionStatus::Error),
            "pending_expiration" => Ok(ConnectionStatus::PendingExpiration),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(Error::InvalidConnectionStatus(other.to_owned())),
        }
    }
}

/// One external bank connection owned by a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Institution {
    /// The id for the institution row.
    pub id: InstitutionId,
    /// The workspace that owns this connection.
    pub workspace_id: WorkspaceId,
    /// The aggregator's item id for this connection.
    pub provider_item_id: String,
    /// The aggregator's id for the underlying institution, when known.
    pub institution_external_id: Option<String>,
    /// Display name, when known.
    pub name: Option<String>,
    /// The encrypted access credential blob.
    pub access_token_blob: String,
    /// The connection state.
    pub status: ConnectionStatus,
    /// The most recent upstream error payload, when the status is `Error`.
    pub last_error: Option<String>,
    /// When this institution last completed a sync.
    pub last_synced_at: Option<OffsetDateTime>,
}

/// The fields needed to create an institution at link time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstitution {
    /// The workspace that owns the connection.
    pub workspace_id: WorkspaceId,
    /// The aggregator's item id.
    pub provider_item_id: String,
    /// The aggregator's institution id, when the link flow captured it.
    pub institution_external_id: Option<String>,
    /// Display name, when the link flow captured it.
    pub name: Option<String>,
    /// The encrypted access credential blob.
    pub access_token_blob: String,
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the institution table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_institution_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS institution (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL,
                provider_item_id TEXT NOT NULL UNIQUE,
                institution_external_id TEXT,
                name TEXT,
                access_token TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_error TEXT,
                last_synced_at TEXT
                )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_institution_workspace ON institution(workspace_id);",
        (),
    )?;

    Ok(())
}

/// Map a database row to an [Institution].
pub fn map_institution_row(row: &Row) -> Result<Institution, rusqlite::Error> {
    let raw_status: String = row.get(6)?;
    let status = ConnectionStatus::parse(&raw_status).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown connection status \"{raw_status}\"").into(),
        )
    })?;

    Ok(Institution {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        provider_item_id: row.get(2)?,
        institution_external_id: row.get(3)?,
        name: row.get(4)?,
        access_token_blob: row.get(5)?,
        status,
        last_error: row.get(7)?,
        last_synced_at: row.get(8)?,
    })
}

const INSTITUTION_COLUMNS: &str = "id, workspace_id, provider_item_id, institution_external_id, \
     name, access_token, status, last_error, last_synced_at";

/// Create a new institution row at link time.
///
/// # Errors
/// This function will return a:
/// - [Error::DuplicateProviderItem] if an institution with the same provider
///   item id already exists,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn create_institution(
    new_institution: NewInstitution,
    connection: &Connection,
) -> Result<Institution, Error> {
    connection
        .prepare(&format!(
            "INSERT INTO institution \
             (workspace_id, provider_item_id, institution_external_id, name, access_token) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             RETURNING {INSTITUTION_COLUMNS}"
        ))?
        .query_row(
            (
                new_institution.workspace_id,
                &new_institution.provider_item_id,
                &new_institution.institution_external_id,
                &new_institution.name,
                &new_institution.access_token_blob,
            ),
            map_institution_row,
        )
        .map_err(|error| match error {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: _,
                    extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE,
                },
                _,
            ) => Error::DuplicateProviderItem,
            error => error.into(),
        })
}

/// Retrieve all institutions linked to `workspace_id`, oldest first.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_institutions_for_workspace(
    workspace_id: WorkspaceId,
    connection: &Connection,
) -> Result<Vec<Institution>, Error> {
    connection
        .prepare(&format!(
            "SELECT {INSTITUTION_COLUMNS} FROM institution \
             WHERE workspace_id = :workspace_id ORDER BY id"
        ))?
        .query_map(&[(":workspace_id", &workspace_id)], map_institution_row)?
        .map(|maybe_institution| maybe_institution.map_err(Error::from))
        .collect()
}

/// Retrieve the institution with the given provider item id.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if no institution has that item id,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn get_institution_by_item_id(
    provider_item_id: &str,
    connection: &Connection,
) -> Result<Institution, Error> {
    let institution = connection
        .prepare(&format!(
            "SELECT {INSTITUTION_COLUMNS} FROM institution \
             WHERE provider_item_id = :provider_item_id"
        ))?
        .query_row(
            &[(":provider_item_id", &provider_item_id)],
            map_institution_row,
        )?;

    Ok(institution)
}

/// Set the connection status of an institution.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to an institution,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn set_institution_status(
    id: InstitutionId,
    status: ConnectionStatus,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE institution SET status = ?1 WHERE id = ?2",
        (status.as_str(), id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Set the status to [ConnectionStatus::Error] and record the upstream error
/// payload for display and debugging.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to an institution,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn record_institution_error(
    id: InstitutionId,
    error_payload: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE institution SET status = 'error', last_error = ?1 WHERE id = ?2",
        (error_payload, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Store a display name fetched from institution metadata.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn set_institution_name(
    id: InstitutionId,
    name: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "UPDATE institution SET name = ?1 WHERE id = ?2",
        (name, id),
    )?;

    Ok(())
}

/// Bump the last-synced watermark after a completed sync.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn update_last_synced_at(
    id: InstitutionId,
    synced_at: OffsetDateTime,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "UPDATE institution SET last_synced_at = ?1 WHERE id = ?2",
        (synced_at, id),
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
