//! Ledger transactions and the reconciliation of provider records onto them.

mod core;

pub use core::{
    Direction, LedgerTransaction, TransactionStatus, TransactionUpsert, UpsertOutcome,
    content_hash, count_transactions_for_workspace, create_ledger_transaction_table,
    get_transaction_by_provider_id, get_transactions_for_workspace, map_ledger_transaction_row,
    normalize_amount, remove_transaction, upsert_transaction,
};
