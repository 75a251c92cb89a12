#![allow(missing_docs)]
//! Shared helpers for driving the sync pipeline in tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rusqlite::Connection;
use time::Date;

use crate::{
    account::{NewBankAccount, create_account},
    aggregator::{
        AggregatorError, BankDataProvider, ProviderAccount, ProviderBalances, ProviderInstitution,
        ProviderTransaction,
    },
    database_id::{InstitutionId, WorkspaceId},
    institution::{NewInstitution, create_institution},
    token::TokenCipher,
};

/// A scripted in-memory stand-in for the aggregator.
///
/// Transactions and accounts are keyed by access token; tokens registered as
/// bad fail every call with the aggregator's dead-token error.
#[derive(Default)]
pub(crate) struct StubBankData {
    transactions: HashMap<String, Vec<ProviderTransaction>>,
    accounts: HashMap<String, Vec<ProviderAccount>>,
    institution_names: HashMap<String, String>,
    bad_tokens: HashSet<String>,
    refresh_supported: bool,
}

impl StubBankData {
    pub(crate) fn new() -> Self {
        Self {
            refresh_supported: true,
            ..Self::default()
        }
    }

    pub(crate) fn with_transactions(
        mut self,
        token: &str,
        transactions: Vec<ProviderTransaction>,
    ) -> Self {
        self.transactions.insert(token.to_owned(), transactions);
        self
    }

    pub(crate) fn with_accounts(mut self, token: &str, accounts: Vec<ProviderAccount>) -> Self {
        self.accounts.insert(token.to_owned(), accounts);
        self
    }

    pub(crate) fn with_bad_token(mut self, token: &str) -> Self {
        self.bad_tokens.insert(token.to_owned());
        self
    }

    pub(crate) fn with_institution_name(mut self, external_id: &str, name: &str) -> Self {
        self.institution_names
            .insert(external_id.to_owned(), name.to_owned());
        self
    }

    pub(crate) fn without_refresh_support(mut self) -> Self {
        self.refresh_supported = false;
        self
    }

    fn check_token(&self, access_token: &str) -> Result<(), AggregatorError> {
        if self.bad_tokens.contains(access_token) {
            return Err(AggregatorError::Api {
                error_type: "ITEM_ERROR".to_owned(),
                error_code: "ITEM_LOGIN_REQUIRED".to_owned(),
                message: "the login details of this item have changed".to_owned(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl BankDataProvider for StubBankData {
    async fn refresh_transactions(&self, access_token: &str) -> Result<(), AggregatorError> {
        self.check_token(access_token)?;

        if !self.refresh_supported {
            return Err(AggregatorError::Api {
                error_type: "INVALID_REQUEST".to_owned(),
                error_code: "PRODUCTS_NOT_SUPPORTED".to_owned(),
                message: "refresh is not supported for this item".to_owned(),
            });
        }

        Ok(())
    }

    async fn get_transactions(
        &self,
        access_token: &str,
        _start_date: Date,
        _end_date: Date,
    ) -> Result<Vec<ProviderTransaction>, AggregatorError> {
        self.check_token(access_token)?;

        Ok(self
            .transactions
            .get(access_token)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, AggregatorError> {
        self.check_token(access_token)?;

        Ok(self.accounts.get(access_token).cloned().unwrap_or_default())
    }

    async fn get_institution_metadata(
        &self,
        institution_external_id: &str,
    ) -> Result<ProviderInstitution, AggregatorError> {
        match self.institution_names.get(institution_external_id) {
            Some(name) => Ok(ProviderInstitution {
                institution_id: institution_external_id.to_owned(),
                name: Some(name.clone()),
                url: None,
            }),
            None => Err(AggregatorError::Api {
                error_type: "INVALID_INPUT".to_owned(),
                error_code: "INSTITUTION_NOT_FOUND".to_owned(),
                message: "institution not found".to_owned(),
            }),
        }
    }
}

/// Build a provider transaction with the fields the pipeline cares about.
pub(crate) fn provider_transaction(
    transaction_id: &str,
    account_id: &str,
    amount: f64,
    date: Date,
) -> ProviderTransaction {
    ProviderTransaction {
        transaction_id: transaction_id.to_owned(),
        account_id: account_id.to_owned(),
        amount,
        iso_currency_code: Some("USD".to_owned()),
        date,
        authorized_date: None,
        name: Some("TEST TRANSACTION".to_owned()),
        merchant_name: None,
        pending: false,
        category: None,
        location: None,
    }
}

/// Build a provider account with a balance snapshot.
pub(crate) fn provider_account(
    account_id: &str,
    current: Option<f64>,
    available: Option<f64>,
) -> ProviderAccount {
    ProviderAccount {
        account_id: account_id.to_owned(),
        name: Some("Everyday Checking".to_owned()),
        mask: Some("0123".to_owned()),
        account_type: Some("depository".to_owned()),
        balances: ProviderBalances {
            current,
            available,
            iso_currency_code: Some("USD".to_owned()),
        },
    }
}

/// Create an institution with one linked account, storing `token` encrypted
/// with `cipher`. Returns the institution id.
pub(crate) fn seed_institution_with_account(
    connection: &Connection,
    cipher: &TokenCipher,
    workspace_id: WorkspaceId,
    provider_item_id: &str,
    provider_account_id: &str,
    token: &str,
) -> InstitutionId {
    let institution = create_institution(
        NewInstitution {
            workspace_id,
            provider_item_id: provider_item_id.to_owned(),
            institution_external_id: Some("ins_109508".to_owned()),
            name: None,
            access_token_blob: cipher.encrypt(token).unwrap(),
        },
        connection,
    )
    .unwrap();

    create_account(
        NewBankAccount {
            institution_id: institution.id,
            workspace_id,
            provider_account_id: provider_account_id.to_owned(),
            name: Some("Everyday Checking".to_owned()),
            mask: Some("0123".to_owned()),
            currency: Some("USD".to_owned()),
        },
        connection,
    )
    .unwrap();

    institution.id
}
