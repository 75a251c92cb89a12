//! Implements a struct that holds the shared state of the server.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::Connection;

use crate::{Error, aggregator::BankDataProvider, db::initialize, token::TokenCipher};

/// How long to wait after asking the aggregator to refresh an item before
/// fetching its transactions, giving the refresh a chance to land. A bounded
/// fixed delay, never a poll loop.
pub const DEFAULT_REFRESH_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// The shared state of the server.
#[derive(Clone)]
pub struct AppState {
    /// The database connection holding the ledger.
    pub db_connection: Arc<Mutex<Connection>>,

    /// Encrypts and decrypts stored aggregator access tokens.
    pub token_cipher: TokenCipher,

    /// The banking-data provider used to fetch transactions and balances.
    pub bank_data: Arc<dyn BankDataProvider>,

    /// The bounded wait applied after a best-effort refresh trigger.
    pub refresh_settle_delay: Duration,
}

impl AppState {
    /// Create a new [AppState] with a SQLite database connection.
    ///
    /// This function will initialize the database by adding the tables for
    /// the domain models.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn new(
        db_connection: Connection,
        token_cipher: TokenCipher,
        bank_data: Arc<dyn BankDataProvider>,
    ) -> Result<Self, Error> {
        initialize(&db_connection)?;

        Ok(Self {
            db_connection: Arc::new(Mutex::new(db_connection)),
            token_cipher,
            bank_data,
            refresh_settle_delay: DEFAULT_REFRESH_SETTLE_DELAY,
        })
    }

    /// Override the refresh settle delay, e.g. zero in tests.
    pub fn with_refresh_settle_delay(mut self, delay: Duration) -> Self {
        self.refresh_settle_delay = delay;
        self
    }
}
