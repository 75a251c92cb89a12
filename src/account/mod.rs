//! Bank accounts: the real-world accounts under a linked institution.

mod core;

pub use core::{
    BankAccount, NewBankAccount, balance_to_cents, create_account, create_bank_account_table,
    get_accounts_for_institution, map_bank_account_row, update_account_balances,
};
