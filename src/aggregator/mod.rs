//! The client for the external banking-data aggregator.
//!
//! The aggregator provides bank-account linking, transaction feeds and
//! balance data. This module wraps its HTTP API in a thin client and exposes
//! the [BankDataProvider] trait so the sync orchestrator can be driven by a
//! scripted provider in tests.

mod client;
mod models;

use async_trait::async_trait;
use time::Date;

pub use client::{AggregatorClient, AggregatorEnv, AggregatorError};
pub use models::{
    ProviderAccount, ProviderBalances, ProviderInstitution, ProviderLocation, ProviderTransaction,
};

/// The operations the sync pipeline needs from a banking-data provider.
///
/// Each method is a single request/response with no internal retries; retry
/// policy belongs to the caller.
#[async_trait]
pub trait BankDataProvider: Send + Sync {
    /// Ask the provider to refresh its transaction feed for the item behind
    /// `access_token`. Best-effort; not all accounts support it.
    async fn refresh_transactions(&self, access_token: &str) -> Result<(), AggregatorError>;

    /// Fetch all transactions for the date range, inclusive on both ends.
    async fn get_transactions(
        &self,
        access_token: &str,
        start_date: Date,
        end_date: Date,
    ) -> Result<Vec<ProviderTransaction>, AggregatorError>;

    /// Fetch the current account set with fresh balances.
    async fn get_accounts(&self, access_token: &str)
    -> Result<Vec<ProviderAccount>, AggregatorError>;

    /// Fetch display metadata for an institution by its external id.
    async fn get_institution_metadata(
        &self,
        institution_external_id: &str,
    ) -> Result<ProviderInstitution, AggregatorError>;
}
