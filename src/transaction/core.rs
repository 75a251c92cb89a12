//! Defines the core data model and database queries for ledger transactions,
//! and the reconciliation of aggregator records onto them.
//!
//! A ledger row is uniquely identified by `(workspace_id,
//! provider_transaction_id)`; correctness under concurrent syncs rests on the
//! UNIQUE constraint over that pair, not on read-then-write logic.

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{
    Error,
    aggregator::ProviderTransaction,
    database_id::{AccountId, DatabaseId, WorkspaceId},
};

// ============================================================================
// MODELS
// ============================================================================

/// Which way money moved. Amounts are stored unsigned; the sign of the
/// movement is carried exclusively here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Money entering the account.
    Inflow,
    /// Money leaving the account.
    Outflow,
}

impl Direction {
    /// The direction as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inflow => "inflow",
            Direction::Outflow => "outflow",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "inflow" => Some(Direction::Inflow),
            "outflow" => Some(Direction::Outflow),
            _ => None,
        }
    }
}

/// Whether a transaction has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Reported but not yet settled; may change or disappear.
    Pending,
    /// Settled.
    Posted,
}

impl TransactionStatus {
    /// The status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Posted => "posted",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(TransactionStatus::Pending),
            "posted" => Some(TransactionStatus::Posted),
            _ => None,
        }
    }
}

/// A single reconciled financial movement in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerTransaction {
    /// The id for the ledger row.
    pub id: DatabaseId,
    /// The workspace that owns the row.
    pub workspace_id: WorkspaceId,
    /// The internal bank account the movement belongs to.
    pub account_id: AccountId,
    /// The aggregator's stable id for this transaction.
    pub provider_transaction_id: String,
    /// Secondary derived key for change detection, independent of the
    /// provider id.
    pub content_hash: i64,
    /// The amount in integer minor currency units. Never negative.
    pub amount_cents: i64,
    /// Which way the money moved.
    pub direction: Direction,
    /// ISO-4217 currency code, when known.
    pub currency: Option<String>,
    /// The date the transaction occurred (or posted).
    pub transaction_date: Date,
    /// The date the transaction was authorized, when reported.
    pub authorized_date: Option<Date>,
    /// Whether the transaction has settled.
    pub status: TransactionStatus,
    /// The resolved merchant name, when the aggregator provided one.
    pub merchant_name: Option<String>,
    /// The raw descriptor line.
    pub description: Option<String>,
    /// The most specific category label, when provided.
    pub category: Option<String>,
    /// City where the transaction took place.
    pub location_city: Option<String>,
    /// Region or state where the transaction took place.
    pub location_region: Option<String>,
    /// Country where the transaction took place.
    pub location_country: Option<String>,
}

/// One provider transaction mapped onto internal identifiers, ready to be
/// reconciled into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpsert {
    /// The workspace that owns the row.
    pub workspace_id: WorkspaceId,
    /// The internal bank account the movement belongs to.
    pub account_id: AccountId,
    /// The aggregator's stable id for this transaction.
    pub provider_transaction_id: String,
    /// The amount in integer minor currency units. Never negative.
    pub amount_cents: i64,
    /// Which way the money moved.
    pub direction: Direction,
    /// ISO-4217 currency code, when known.
    pub currency: Option<String>,
    /// The date the transaction occurred (or posted).
    pub transaction_date: Date,
    /// The date the transaction was authorized, when reported.
    pub authorized_date: Option<Date>,
    /// Whether the transaction has settled.
    pub status: TransactionStatus,
    /// The resolved merchant name, when provided.
    pub merchant_name: Option<String>,
    /// The raw descriptor line.
    pub description: Option<String>,
    /// The most specific category label, when provided.
    pub category: Option<String>,
    /// City where the transaction took place.
    pub location_city: Option<String>,
    /// Region or state where the transaction took place.
    pub location_region: Option<String>,
    /// Country where the transaction took place.
    pub location_country: Option<String>,
}

impl TransactionUpsert {
    /// Map a provider transaction onto internal identifiers.
    ///
    /// `account_id` must already be resolved from the provider's account id;
    /// transactions referencing unknown provider accounts are skipped by the
    /// caller, never inserted with a dangling reference.
    pub fn from_provider(
        transaction: &ProviderTransaction,
        workspace_id: WorkspaceId,
        account_id: AccountId,
    ) -> Self {
        let (amount_cents, direction) = normalize_amount(transaction.amount);
        let status = if transaction.pending {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Posted
        };
        let location = transaction.location.clone().unwrap_or_default();

        Self {
            workspace_id,
            account_id,
            provider_transaction_id: transaction.transaction_id.clone(),
            amount_cents,
            direction,
            currency: transaction.iso_currency_code.clone(),
            transaction_date: transaction.date,
            authorized_date: transaction.authorized_date,
            status,
            merchant_name: transaction.merchant_name.clone(),
            description: transaction.name.clone(),
            category: transaction.leaf_category().map(str::to_owned),
            location_city: location.city,
            location_region: location.region,
            location_country: location.country,
        }
    }
}

/// The result of reconciling one provider transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// The ledger row after the mutation.
    pub transaction: LedgerTransaction,
    /// True when the row was created by this call, false when an existing row
    /// was updated.
    pub is_new: bool,
}

/// Convert a signed major-unit amount into unsigned minor units and a
/// direction.
///
/// Rounds half away from zero on the absolute value. The aggregator reports
/// money leaving the account as a positive amount, so positive maps to
/// [Direction::Outflow]; this mapping is a tested contract with the feed, not
/// a bookkeeping convention.
pub fn normalize_amount(amount: f64) -> (i64, Direction) {
    let amount_cents = (amount.abs() * 100.0).round() as i64;
    let direction = if amount < 0.0 {
        Direction::Inflow
    } else {
        Direction::Outflow
    };

    (amount_cents, direction)
}

/// Derive the secondary change-detection key for a ledger row.
///
/// Hashes `(provider_transaction_id, workspace_id, transaction_date)` with
/// md5 and folds the first eight bytes into an i64.
pub fn content_hash(
    provider_transaction_id: &str,
    workspace_id: WorkspaceId,
    transaction_date: Date,
) -> i64 {
    let hash_input = format!("{provider_transaction_id}|{workspace_id}|{transaction_date}");
    let hash_128 = md5::compute(hash_input.as_bytes());
    let mut hash_64 = [0; 8];
    hash_64.copy_from_slice(&hash_128[0..8]);
    i64::from_le_bytes(hash_64)
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the ledger transaction table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_ledger_transaction_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS ledger_transaction (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                provider_transaction_id TEXT NOT NULL,
                content_hash INTEGER NOT NULL,
                amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
                direction TEXT NOT NULL,
                currency TEXT,
                transaction_date TEXT NOT NULL,
                authorized_date TEXT,
                status TEXT NOT NULL,
                merchant_name TEXT,
                description TEXT,
                category TEXT,
                location_city TEXT,
                location_region TEXT,
                location_country TEXT,
                UNIQUE(workspace_id, provider_transaction_id),
                FOREIGN KEY(account_id) REFERENCES bank_account(id)
                    ON UPDATE CASCADE ON DELETE CASCADE
                )",
        (),
    )?;

    // Composite index used by the workspace transaction listing.
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_workspace_date
         ON ledger_transaction(workspace_id, transaction_date);",
        (),
    )?;

    Ok(())
}

/// Map a database row to a [LedgerTransaction].
pub fn map_ledger_transaction_row(row: &Row) -> Result<LedgerTransaction, rusqlite::Error> {
    let raw_direction: String = row.get(6)?;
    let direction = Direction::parse(&raw_direction).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown direction \"{raw_direction}\"").into(),
        )
    })?;

    let raw_status: String = row.get(10)?;
    let status = TransactionStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            format!("unknown transaction status \"{raw_status}\"").into(),
        )
    })?;

    Ok(LedgerTransaction {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        account_id: row.get(2)?,
        provider_transaction_id: row.get(3)?,
        content_hash: row.get(4)?,
        amount_cents: row.get(5)?,
        direction,
        currency: row.get(7)?,
        transaction_date: row.get(8)?,
        authorized_date: row.get(9)?,
        status,
        merchant_name: row.get(11)?,
        description: row.get(12)?,
        category: row.get(13)?,
        location_city: row.get(14)?,
        location_region: row.get(15)?,
        location_country: row.get(16)?,
    })
}

const LEDGER_COLUMNS: &str = "id, workspace_id, account_id, provider_transaction_id, \
     content_hash, amount_cents, direction, currency, transaction_date, authorized_date, \
     status, merchant_name, description, category, location_city, location_region, \
     location_country";

/// Reconcile one provider transaction into the ledger.
///
/// Inserts a new row when `(workspace_id, provider_transaction_id)` is
/// unseen, otherwise updates the mutable fields (amount, status, dates,
/// enrichment) in place. The insert uses `ON CONFLICT DO NOTHING` so two
/// overlapping syncs racing on the same first observation both resolve at the
/// UNIQUE constraint: the loser of the race observes zero inserted rows and
/// takes the update path.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error,
/// e.g. a constraint violation unrelated to the dedup key.
pub fn upsert_transaction(
    upsert: &TransactionUpsert,
    connection: &Connection,
) -> Result<UpsertOutcome, Error> {
    let hash = content_hash(
        &upsert.provider_transaction_id,
        upsert.workspace_id,
        upsert.transaction_date,
    );

    let inserted = connection.execute(
        "INSERT INTO ledger_transaction (
                workspace_id, account_id, provider_transaction_id, content_hash,
                amount_cents, direction, currency, transaction_date, authorized_date,
                status, merchant_name, description, category,
                location_city, location_region, location_country
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16
            )
            ON CONFLICT(workspace_id, provider_transaction_id) DO NOTHING",
        (
            upsert.workspace_id,
            upsert.account_id,
            &upsert.provider_transaction_id,
            hash,
            upsert.amount_cents,
            upsert.direction.as_str(),
            &upsert.currency,
            upsert.transaction_date,
            upsert.authorized_date,
            upsert.status.as_str(),
            &upsert.merchant_name,
            &upsert.description,
            &upsert.category,
            &upsert.location_city,
            &upsert.location_region,
            &upsert.location_country,
        ),
    )?;

    let is_new = inserted == 1;

    if !is_new {
        connection.execute(
            "UPDATE ledger_transaction SET
                    content_hash = ?1,
                    amount_cents = ?2,
                    direction = ?3,
                    currency = ?4,
                    transaction_date = ?5,
                    authorized_date = ?6,
                    status = ?7,
                    merchant_name = ?8,
                    description = ?9,
                    category = ?10,
                    location_city = ?11,
                    location_region = ?12,
                    location_country = ?13
                 WHERE workspace_id = ?14 AND provider_transaction_id = ?15",
            (
                hash,
                upsert.amount_cents,
                upsert.direction.as_str(),
                &upsert.currency,
                upsert.transaction_date,
                upsert.authorized_date,
                upsert.status.as_str(),
                &upsert.merchant_name,
                &upsert.description,
                &upsert.category,
                &upsert.location_city,
                &upsert.location_region,
                &upsert.location_country,
                upsert.workspace_id,
                &upsert.provider_transaction_id,
            ),
        )?;
    }

    let transaction =
        get_transaction_by_provider_id(&upsert.provider_transaction_id, upsert.workspace_id, connection)?;

    Ok(UpsertOutcome {
        transaction,
        is_new,
    })
}

type RowsAffected = usize;

/// Delete the ledger row for a removed provider transaction.
///
/// Deleting a row that does not exist is not an error; the aggregator may
/// redeliver removal events.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn remove_transaction(
    provider_transaction_id: &str,
    workspace_id: WorkspaceId,
    connection: &Connection,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "DELETE FROM ledger_transaction
             WHERE workspace_id = ?1 AND provider_transaction_id = ?2",
            (workspace_id, provider_transaction_id),
        )
        .map_err(Error::from)
}

/// Retrieve a ledger row by its dedup key.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if the key matches no row,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn get_transaction_by_provider_id(
    provider_transaction_id: &str,
    workspace_id: WorkspaceId,
    connection: &Connection,
) -> Result<LedgerTransaction, Error> {
    let transaction = connection
        .prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_transaction
             WHERE workspace_id = ?1 AND provider_transaction_id = ?2"
        ))?
        .query_row(
            (workspace_id, provider_transaction_id),
            map_ledger_transaction_row,
        )?;

    Ok(transaction)
}

/// Retrieve all transactions for a workspace, newest first.
///
/// This is the read contract the dashboard consumes.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_transactions_for_workspace(
    workspace_id: WorkspaceId,
    connection: &Connection,
) -> Result<Vec<LedgerTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_transaction
             WHERE workspace_id = :workspace_id
             ORDER BY transaction_date DESC, id DESC"
        ))?
        .query_map(&[(":workspace_id", &workspace_id)], map_ledger_transaction_row)?
        .map(|maybe_transaction| maybe_transaction.map_err(Error::from))
        .collect()
}

/// Get the total number of ledger rows in a workspace.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn count_transactions_for_workspace(
    workspace_id: WorkspaceId,
    connection: &Connection,
) -> Result<u32, Error> {
    connection
        .query_row(
            "SELECT COUNT(id) FROM ledger_transaction WHERE workspace_id = :workspace_id",
            &[(":workspace_id", &workspace_id)],
            |row| row.get(0),
        )
        .map_err(Error::from)
}

// ============================================================================
// TESTS
// ============================================================================
