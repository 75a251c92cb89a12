/*! Database initialization for the application's SQLite schema. */

use rusqlite::{Connection, Transaction as SqlTransaction};

use crate::{
    Error,
    account::create_bank_account_table,
    institution::create_institution_table,
    transaction::create_ledger_transaction_table,
    webhook::create_webhook_event_table,
};

/// Create all application tables inside a single exclusive transaction.
///
/// Safe to call on every startup; tables are only created when missing.
///
/// # Errors
/// Returns an error if a table cannot be created or if there is an SQL error.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    let transaction =
        SqlTransaction::new_unchecked(connection, rusqlite::TransactionBehavior::Exclusive)?;

    create_institution_table(&transaction)?;
    create_bank_account_table(&transaction)?;
    create_ledger_transaction_table(&transaction)?;
    create_webhook_event_table(&transaction)?;

    transaction.commit()?;

    Ok(())
}

#[cfg(test)]
mod initialize_tests {
    use rusqlite::Connection;

    use super::initialize;

    #[test]
    fn schema_is_valid() {
        let connection =
            Connection::open_in_memory().expect("Could not initialise in-memory SQLite database");

        assert_eq!(Ok(()), initialize(&connection));
    }

    #[test]
    fn initialize_is_idempotent() {
        let connection = Connection::open_in_memory().unwrap();

        initialize(&connection).unwrap();

        assert_eq!(Ok(()), initialize(&connection));
    }
}
