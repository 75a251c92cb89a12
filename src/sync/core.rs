//! The sync orchestrator: drives the reconciliation of every institution in a
//! workspace against the aggregator.
//!
//! Institutions are processed sequentially, deliberately, to bound aggregator
//! rate usage and keep partial-failure accounting simple. A failure in one
//! institution never aborts the run; it is counted and the loop moves on.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use rusqlite::Connection;
use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::{
    Error,
    account::{balance_to_cents, get_accounts_for_institution, update_account_balances},
    aggregator::{AggregatorError, BankDataProvider},
    database_id::{AccountId, WorkspaceId},
    institution::{
        Institution, get_institutions_for_workspace, record_institution_error,
        set_institution_name, update_last_synced_at,
    },
    token::TokenCipher,
    transaction::{TransactionUpsert, upsert_transaction},
};

/// How far back a sync reaches when the caller does not say.
const DEFAULT_WINDOW_DAYS: i64 = 90;

/// The date range a sync fetches transactions for, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    /// The first date to fetch.
    pub start_date: Date,
    /// The last date to fetch.
    pub end_date: Date,
}

impl SyncWindow {
    /// Create a window from explicit bounds.
    ///
    /// # Errors
    /// Returns [Error::InvalidSyncWindow] when `start_date` is after
    /// `end_date`.
    pub fn new(start_date: Date, end_date: Date) -> Result<Self, Error> {
        if start_date > end_date {
            return Err(Error::InvalidSyncWindow(format!(
                "start date {start_date} is after end date {end_date}"
            )));
        }

        Ok(Self {
            start_date,
            end_date,
        })
    }

    /// The default window: the last 90 days through tomorrow.
    /// The end date reaches one day past `today` so transactions
    /// stamped in a timezone ahead of the server are not missed at the
    /// boundary.
    pub fn default_for(today: Date) -> Self {
        Self {
            start_date: today.saturating_sub(time::Duration::days(DEFAULT_WINDOW_DAYS)),
            end_date: today.saturating_add(time::Duration::days(1)),
        }
    }

    /// Build a window from optional bounds, filling gaps from the default
    /// window for `today`.
    ///
    /// # Errors
    /// Returns [Error::InvalidSyncWindow] when the resolved start is after
    /// the resolved end.
    pub fn from_bounds(
        start_date: Option<Date>,
        end_date: Option<Date>,
        today: Date,
    ) -> Result<Self, Error> {
        let default_window = Self::default_for(today);

        Self::new(
            start_date.unwrap_or(default_window.start_date),
            end_date.unwrap_or(default_window.end_date),
        )
    }
}

/// The aggregate result of one sync invocation, returned to the caller.
///
/// Partial success is reported as success with a non-zero error count; a
/// single bad institution never masks the institutions that synced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    /// False only when there was nothing to sync at all.
    pub success: bool,
    /// Explanation for `success: false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Institutions that completed the full sync sequence.
    pub institutions_synced: u32,
    /// Ledger rows created.
    pub new_transactions: u32,
    /// Ledger rows updated in place.
    pub updated_transactions: u32,
    /// Accounts whose balances were refreshed.
    pub accounts_updated: u32,
    /// Transactions skipped because their provider account is not linked.
    pub skipped_transactions: u32,
    /// Failures counted without aborting the run.
    pub errors: u32,
    /// The effective start of the fetched window.
    pub start_date: Date,
    /// The effective end of the fetched window.
    pub end_date: Date,
}

impl SyncSummary {
    fn new(window: SyncWindow) -> Self {
        Self {
            success: true,
            message: None,
            institutions_synced: 0,
            new_transactions: 0,
            updated_transactions: 0,
            accounts_updated: 0,
            skipped_transactions: 0,
            errors: 0,
            start_date: window.start_date,
            end_date: window.end_date,
        }
    }
}

/// Everything the orchestrator needs to run, borrowed from the app state.
pub struct SyncContext<'a> {
    /// The ledger database.
    pub db_connection: &'a Mutex<Connection>,
    /// Decrypts stored access tokens.
    pub token_cipher: &'a TokenCipher,
    /// The banking-data provider.
    pub bank_data: &'a dyn BankDataProvider,
    /// The bounded wait after a best-effort refresh trigger.
    pub refresh_settle_delay: Duration,
}

/// Sync every institution linked to `workspace_id`.
///
/// # Errors
/// Returns an error only for setup failures (e.g. the institution list could
/// not be read). Per-institution and per-transaction failures are counted in
/// the summary instead.
pub async fn sync_workspace(
    workspace_id: WorkspaceId,
    window: SyncWindow,
    context: &SyncContext<'_>,
) -> Result<SyncSummary, Error> {
    let institutions = {
        let connection = context
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        get_institutions_for_workspace(workspace_id, &connection)?
    };

    if institutions.is_empty() {
        tracing::info!("workspace {workspace_id} has no linked institutions, nothing to sync");
        let mut summary = SyncSummary::new(window);
        summary.success = false;
        summary.message = Some("no institutions are linked to this workspace".to_owned());
        return Ok(summary);
    }

    Ok(sync_institutions(&institutions, window, context).await)
}

/// Sync the given institutions sequentially, aggregating results and errors.
///
/// Used directly by webhook handling, which has already resolved the single
/// institution the event refers to.
pub async fn sync_institutions(
    institutions: &[Institution],
    window: SyncWindow,
    context: &SyncContext<'_>,
) -> SyncSummary {
    let start_time = std::time::Instant::now();
    let mut summary = SyncSummary::new(window);

    for institution in institutions {
        match sync_one_institution(institution, window, context, &mut summary).await {
            Ok(()) => summary.institutions_synced += 1,
            Err(reason) => {
                tracing::error!(
                    "sync failed for institution {} (workspace {}): {reason}",
                    institution.id,
                    institution.workspace_id
                );
                summary.errors += 1;
            }
        }
    }

    tracing::info!(
        "synced {}/{} institutions in {:.1}ms: {} new, {} updated, {} skipped, {} errors",
        summary.institutions_synced,
        institutions.len(),
        start_time.elapsed().as_millis(),
        summary.new_transactions,
        summary.updated_transactions,
        summary.skipped_transactions,
        summary.errors,
    );

    summary
}

/// Run the full sync sequence for one institution.
///
/// Failures are returned as a human-readable reason; the caller counts them
/// and continues with the next institution.
async fn sync_one_institution(
    institution: &Institution,
    window: SyncWindow,
    context: &SyncContext<'_>,
    summary: &mut SyncSummary,
) -> Result<(), String> {
    let decrypted = context.token_cipher.decrypt(&institution.access_token_blob);
    tracing::debug!(
        "institution {}: access token obtained via {:?}",
        institution.id,
        decrypted.strategy
    );
    let access_token = decrypted.token;

    // Best-effort: ask the aggregator for fresh data and give the refresh a
    // bounded moment to land. Not all accounts support it; failure here must
    // not fail the sync.
    match context.bank_data.refresh_transactions(&access_token).await {
        Ok(()) => tokio::time::sleep(context.refresh_settle_delay).await,
        Err(error) => {
            tracing::debug!(
                "institution {}: refresh not available, fetching directly: {error}",
                institution.id
            );
        }
    }

    let transactions = context
        .bank_data
        .get_transactions(&access_token, window.start_date, window.end_date)
        .await
        .map_err(|error| fetch_failure(institution, error, context))?;

    let provider_accounts = context
        .bank_data
        .get_accounts(&access_token)
        .await
        .map_err(|error| fetch_failure(institution, error, context))?;

    // Institutions linked before metadata capture have no display name; fill
    // it in opportunistically while we are talking to the aggregator anyway.
    let mut fetched_name = None;
    if institution.name.is_none() {
        if let Some(external_id) = &institution.institution_external_id {
            match context.bank_data.get_institution_metadata(external_id).await {
                Ok(metadata) => fetched_name = metadata.name,
                Err(error) => {
                    tracing::debug!(
                        "institution {}: could not fetch metadata: {error}",
                        institution.id
                    );
                }
            }
        }
    }

    let synced_at = OffsetDateTime::now_utc();
    let connection = context
        .db_connection
        .lock()
        .map_err(|_| "could not acquire the database lock".to_owned())?;

    let account_ids: HashMap<String, AccountId> =
        get_accounts_for_institution(institution.id, &connection)
            .map_err(|error| error.to_string())?
            .into_iter()
            .map(|account| (account.provider_account_id, account.id))
            .collect();

    for transaction in &transactions {
        let Some(&account_id) = account_ids.get(&transaction.account_id) else {
            tracing::warn!(
                "institution {}: transaction {} references unknown provider account {}, skipping",
                institution.id,
                transaction.transaction_id,
                transaction.account_id
            );
            summary.skipped_transactions += 1;
            continue;
        };

        let upsert =
            TransactionUpsert::from_provider(transaction, institution.workspace_id, account_id);

        match upsert_transaction(&upsert, &connection) {
            Ok(outcome) if outcome.is_new => summary.new_transactions += 1,
            Ok(_) => summary.updated_transactions += 1,
            Err(error) => {
                tracing::error!(
                    "institution {}: could not reconcile transaction {}: {error}",
                    institution.id,
                    transaction.transaction_id
                );
                summary.errors += 1;
            }
        }
    }

    for account in &provider_accounts {
        let updated = update_account_balances(
            institution.workspace_id,
            &account.account_id,
            balance_to_cents(account.balances.current),
            balance_to_cents(account.balances.available),
            synced_at,
            &connection,
        );

        match updated {
            Ok(0) => {
                tracing::debug!(
                    "institution {}: provider account {} has no linked row, balances not stored",
                    institution.id,
                    account.account_id
                );
            }
            Ok(_) => summary.accounts_updated += 1,
            Err(error) => {
                tracing::error!(
                    "institution {}: could not update balances for account {}: {error}",
                    institution.id,
                    account.account_id
                );
                summary.errors += 1;
            }
        }
    }

    if let Some(name) = fetched_name {
        if let Err(error) = set_institution_name(institution.id, &name, &connection) {
            tracing::debug!(
                "institution {}: could not store fetched name: {error}",
                institution.id
            );
        }
    }

    update_last_synced_at(institution.id, synced_at, &connection)
        .map_err(|error| error.to_string())?;

    Ok(())
}

/// Describe a fetch failure and, when the token is dead, flip the institution
/// into the error state so the dashboard can prompt a re-link.
fn fetch_failure(
    institution: &Institution,
    error: AggregatorError,
    context: &SyncContext<'_>,
) -> String {
    if error.is_token_error() {
        match context.db_connection.lock() {
            Ok(connection) => {
                if let Err(record_error) =
                    record_institution_error(institution.id, &error.to_string(), &connection)
                {
                    tracing::error!(
                        "could not record error state for institution {}: {record_error}",
                        institution.id
                    );
                }
            }
            Err(_) => {
                tracing::error!(
                    "could not acquire the database lock to record error state for institution {}",
                    institution.id
                );
            }
        }
    }

    error.to_string()
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod sync_tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use rusqlite::Connection;
    use time::macros::date;

    use crate::{
        account::get_accounts_for_institution,
        db::initialize,
        institution::{ConnectionStatus, get_institution_by_item_id},
        test_utils::{
            StubBankData, provider_account, provider_transaction, seed_institution_with_account,
        },
        token::TokenCipher,
        transaction::{
            Direction, count_transactions_for_workspace, get_transaction_by_provider_id,
        },
    };

    use super::{SyncContext, SyncWindow, sync_workspace};

    fn test_window() -> SyncWindow {
        SyncWindow::new(date!(2025 - 03 - 01), date!(2025 - 06 - 02)).unwrap()
    }

    fn test_db() -> Mutex<Connection> {
        let connection = Connection::open_in_memory().unwrap();
        initialize(&connection).unwrap();
        Mutex::new(connection)
    }

    #[tokio::test]
    async fn syncs_transactions_and_balances() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        let institution_id = {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a")
        };

        let bank_data = StubBankData::new()
            .with_transactions(
                "token-a",
                vec![
                    provider_transaction("txn-1", "acc-1", 42.50, date!(2025 - 06 - 01)),
                    provider_transaction("txn-2", "acc-1", -10.00, date!(2025 - 06 - 01)),
                ],
            )
            .with_accounts(
                "token-a",
                vec![provider_account("acc-1", Some(1020.55), Some(980.00))],
            );

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(1, test_window(), &context).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.institutions_synced, 1);
        assert_eq!(summary.new_transactions, 2);
        assert_eq!(summary.updated_transactions, 0);
        assert_eq!(summary.accounts_updated, 1);
        assert_eq!(summary.errors, 0);

        let connection = db_connection.lock().unwrap();
        let outflow = get_transaction_by_provider_id("txn-1", 1, &connection).unwrap();
        assert_eq!(outflow.amount_cents, 4250);
        assert_eq!(outflow.direction, Direction::Outflow);

        let inflow = get_transaction_by_provider_id("txn-2", 1, &connection).unwrap();
        assert_eq!(inflow.amount_cents, 1000);
        assert_eq!(inflow.direction, Direction::Inflow);

        let accounts = get_accounts_for_institution(institution_id, &connection).unwrap();
        assert_eq!(accounts[0].current_balance_cents, Some(102055));
        assert_eq!(accounts[0].available_balance_cents, Some(98000));

        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert!(institution.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn second_sync_updates_instead_of_duplicating() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a");
        }

        let bank_data = StubBankData::new().with_transactions(
            "token-a",
            vec![provider_transaction("txn-1", "acc-1", 42.50, date!(2025 - 06 - 01))],
        );

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let first = sync_workspace(1, test_window(), &context).await.unwrap();
        let second = sync_workspace(1, test_window(), &context).await.unwrap();

        assert_eq!(first.new_transactions, 1);
        assert_eq!(second.new_transactions, 0);
        assert_eq!(second.updated_transactions, 1);

        let connection = db_connection.lock().unwrap();
        assert_eq!(count_transactions_for_workspace(1, &connection).unwrap(), 1);
    }

    #[tokio::test]
    async fn one_bad_institution_does_not_abort_the_run() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-a", "acc-a", "token-a");
            seed_institution_with_account(&connection, &cipher, 1, "item-b", "acc-b", "token-b");
            seed_institution_with_account(&connection, &cipher, 1, "item-c", "acc-c", "token-c");
        }

        let bank_data = StubBankData::new()
            .with_transactions(
                "token-a",
                vec![provider_transaction("txn-a", "acc-a", 1.00, date!(2025 - 06 - 01))],
            )
            .with_bad_token("token-b")
            .with_transactions(
                "token-c",
                vec![provider_transaction("txn-c", "acc-c", 2.00, date!(2025 - 06 - 01))],
            );

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(1, test_window(), &context).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.institutions_synced, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.new_transactions, 2);

        // The institutions on either side of the failure both committed.
        let connection = db_connection.lock().unwrap();
        assert!(get_transaction_by_provider_id("txn-a", 1, &connection).is_ok());
        assert!(get_transaction_by_provider_id("txn-c", 1, &connection).is_ok());
    }

    #[tokio::test]
    async fn dead_token_flips_institution_into_error_state() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a");
        }

        let bank_data = StubBankData::new().with_bad_token("token-a");

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(1, test_window(), &context).await.unwrap();

        assert_eq!(summary.errors, 1);
        let connection = db_connection.lock().unwrap();
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.status, ConnectionStatus::Error);
        assert!(institution.last_error.is_some());
    }

    #[tokio::test]
    async fn unknown_provider_account_is_skipped_not_inserted() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a");
        }

        let bank_data = StubBankData::new().with_transactions(
            "token-a",
            vec![
                provider_transaction("txn-known", "acc-1", 1.00, date!(2025 - 06 - 01)),
                provider_transaction("txn-orphan", "acc-new", 2.00, date!(2025 - 06 - 01)),
            ],
        );

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(1, test_window(), &context).await.unwrap();

        assert_eq!(summary.new_transactions, 1);
        assert_eq!(summary.skipped_transactions, 1);
        let connection = db_connection.lock().unwrap();
        assert_eq!(count_transactions_for_workspace(1, &connection).unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_workspace_reports_no_success_without_erroring() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        let bank_data = StubBankData::new();

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(7, test_window(), &context).await.unwrap();

        assert!(!summary.success);
        assert!(summary.message.is_some());
        assert_eq!(summary.institutions_synced, 0);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn failed_refresh_trigger_does_not_fail_the_sync() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a");
        }

        let bank_data = StubBankData::new()
            .with_transactions(
                "token-a",
                vec![provider_transaction("txn-1", "acc-1", 1.00, date!(2025 - 06 - 01))],
            )
            .without_refresh_support();

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        let summary = sync_workspace(1, test_window(), &context).await.unwrap();

        assert_eq!(summary.errors, 0);
        assert_eq!(summary.new_transactions, 1);
    }

    #[tokio::test]
    async fn institution_name_is_backfilled_from_metadata() {
        let db_connection = test_db();
        let cipher = TokenCipher::from_secret("test-secret");
        {
            let connection = db_connection.lock().unwrap();
            seed_institution_with_account(&connection, &cipher, 1, "item-1", "acc-1", "token-a");
        }

        let bank_data = StubBankData::new()
            .with_institution_name("ins_109508", "First Platypus Bank")
            .with_accounts("token-a", vec![provider_account("acc-1", Some(1.0), None)]);

        let context = SyncContext {
            db_connection: &db_connection,
            token_cipher: &cipher,
            bank_data: &bank_data,
            refresh_settle_delay: Duration::ZERO,
        };

        sync_workspace(1, test_window(), &context).await.unwrap();

        let connection = db_connection.lock().unwrap();
        let institution = get_institution_by_item_id("item-1", &connection).unwrap();
        assert_eq!(institution.name.as_deref(), Some("First Platypus Bank"));
    }
}
