//! Defines the core data model and database queries for bank accounts.
//!
//! Accounts are created exclusively at link time; syncs only ever update
//! balances on existing rows.

use rusqlite::{Connection, Row};
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{AccountId, InstitutionId, WorkspaceId},
};

// ============================================================================
// MODELS
// ============================================================================

/// One real-world bank account under a linked institution.
#[derive(Debug, Clone, PartialEq)]
pub struct BankAccount {
    /// The id for the account row.
    pub id: AccountId,
    /// The institution this account belongs to. Never null; an account
    /// without an institution indicates a partial-creation bug.
    pub institution_id: InstitutionId,
    /// The workspace that owns the account.
    pub workspace_id: WorkspaceId,
    /// The aggregator's stable id for this account.
    pub provider_account_id: String,
    /// Display name.
    pub name: Option<String>,
    /// Last digits of the account number.
    pub mask: Option<String>,
    /// The current balance in integer minor currency units, when reported.
    pub current_balance_cents: Option<i64>,
    /// The available balance in integer minor currency units, when reported.
    pub available_balance_cents: Option<i64>,
    /// ISO-4217 currency code, when known.
    pub currency: Option<String>,
    /// Whether the account is still active at the institution.
    pub is_active: bool,
    /// When balances were last refreshed from the aggregator.
    pub last_synced_at: Option<OffsetDateTime>,
}

/// The fields needed to create a bank account at link time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBankAccount {
    /// The institution the account belongs to.
    pub institution_id: InstitutionId,
    /// The workspace that owns the account.
    pub workspace_id: WorkspaceId,
    /// The aggregator's stable id for this account.
    pub provider_account_id: String,
    /// Display name.
    pub name: Option<String>,
    /// Last digits of the account number.
    pub mask: Option<String>,
    /// ISO-4217 currency code, when known.
    pub currency: Option<String>,
}

/// Convert a major-unit balance to integer minor units.
///
/// Rounds half away from zero and preserves the sign; `None` passes through
/// as `None`, never zero.
pub fn balance_to_cents(balance: Option<f64>) -> Option<i64> {
    balance.map(|value| (value * 100.0).round() as i64)
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the bank account table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_bank_account_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS bank_account (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                institution_id INTEGER NOT NULL,
                workspace_id INTEGER NOT NULL,
                provider_account_id TEXT NOT NULL,
                name TEXT,
                mask TEXT,
                current_balance_cents INTEGER,
                available_balance_cents INTEGER,
                currency TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_synced_at TEXT,
                UNIQUE(workspace_id, provider_account_id),
                FOREIGN KEY(institution_id) REFERENCES institution(id)
                    ON UPDATE CASCADE ON DELETE CASCADE
                )",
        (),
    )?;

    Ok(())
}

/// Map a database row to a [BankAccount].
pub fn map_bank_account_row(row: &Row) -> Result<BankAccount, rusqlite::Error> {
    Ok(BankAccount {
        id: row.get(0)?,
        institution_id: row.get(1)?,
        workspace_id: row.get(2)?,
        provider_account_id: row.get(3)?,
        name: row.get(4)?,
        mask: row.get(5)?,
        current_balance_cents: row.get(6)?,
        available_balance_cents: row.get(7)?,
        currency: row.get(8)?,
        is_active: row.get(9)?,
        last_synced_at: row.get(10)?,
    })
}

const BANK_ACCOUNT_COLUMNS: &str = "id, institution_id, workspace_id, provider_account_id, name, \
     mask, current_balance_cents, available_balance_cents, currency, is_active, last_synced_at";

/// Create a new bank account row at link time.
///
/// # Errors
/// This function will return a:
/// - [Error::InvalidInstitution] if `institution_id` does not refer to a real
///   institution (accounts must never exist without one),
/// - [Error::DuplicateProviderAccount] if the provider account id already
///   exists in the workspace,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn create_account(
    new_account: NewBankAccount,
    connection: &Connection,
) -> Result<BankAccount, Error> {
    // SQLite does not enforce the foreign key by default, so check the
    // institution exists before inserting.
    let institution_exists: bool = connection
        .prepare("SELECT EXISTS(SELECT 1 FROM institution WHERE id = :id)")?
        .query_row(&[(":id", &new_account.institution_id)], |row| row.get(0))?;

    if !institution_exists {
        return Err(Error::InvalidInstitution);
    }

    connection
        .prepare(&format!(
            "INSERT INTO bank_account \
             (institution_id, workspace_id, provider_account_id, name, mask, currency) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             RETURNING {BANK_ACCOUNT_COLUMNS}"
        ))?
        .query_row(
            (
                new_account.institution_id,
                new_account.workspace_id,
                &new_account.provider_account_id,
                &new_account.name,
                &new_account.mask,
                &new_account.currency,
            ),
            map_bank_account_row,
        )
        .map_err(|error| match error {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: _,
                    extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE,
                },
                _,
            ) => Error::DuplicateProviderAccount,
            error => error.into(),
        })
}

/// Retrieve all accounts under `institution_id`, oldest first.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_accounts_for_institution(
    institution_id: InstitutionId,
    connection: &Connection,
) -> Result<Vec<BankAccount>, Error> {
    connection
        .prepare(&format!(
            "SELECT {BANK_ACCOUNT_COLUMNS} FROM bank_account \
             WHERE institution_id = :institution_id ORDER BY id"
        ))?
        .query_map(&[(":institution_id", &institution_id)], map_bank_account_row)?
        .map(|maybe_account| maybe_account.map_err(Error::from))
        .collect()
}

type RowsAffected = usize;

/// Update the stored balances for one account and bump its sync timestamp.
///
/// This is update-only: accounts are created at link time, never during a
/// sync, so a provider account with no matching row affects zero rows and the
/// caller decides whether that is worth counting. Null balances are stored as
/// null, not zero.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn update_account_balances(
    workspace_id: WorkspaceId,
    provider_account_id: &str,
    current_balance_cents: Option<i64>,
    available_balance_cents: Option<i64>,
    synced_at: OffsetDateTime,
    connection: &Connection,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE bank_account SET
                current_balance_cents = ?1,
                available_balance_cents = ?2,
                last_synced_at = ?3
             WHERE workspace_id = ?4 AND provider_account_id = ?5",
            (
                current_balance_cents,
                available_balance_cents,
                synced_at,
                workspace_id,
                provider_account_id,
            ),
        )
        .map_err(Error::from)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod balance_to_cents_tests {
    use super::balance_to_cents;

    #[test]
    fn converts_major_units_to_cents() {
        assert_eq!(balance_to_cents(Some(1020.55)), Some(102055));
    }

    #[test]
    fn preserves_sign_for_credit_balances() {
        assert_eq!(balance_to_cents(Some(-250.75)), Some(-25075));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(balance_to_cents(Some(0.005)), Some(1));
        assert_eq!(balance_to_cents(Some(-0.005)), Some(-1));
    }

    #[test]
    fn none_passes_through_as_none() {
        assert_eq!(balance_to_cents(None), None);
    }
}
