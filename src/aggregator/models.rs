//! Wire types for aggregator API payloads.
//!
//! The aggregator's JSON carries many optional nested fields. Each payload is
//! modelled as an explicit optional-field record so callers read named fields
//! instead of indexing into loosely-shaped JSON.

use serde::{Deserialize, Serialize};
use time::Date;

/// One transaction as reported by the aggregator.
///
/// Amounts are signed floats in major currency units; the aggregator reports
/// money leaving the account as a positive amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    /// The aggregator's stable id for this transaction.
    pub transaction_id: String,
    /// The aggregator's id for the account the transaction belongs to.
    pub account_id: String,
    /// Signed amount in major currency units.
    pub amount: f64,
    /// ISO-4217 currency code, when known.
    #[serde(default)]
    pub iso_currency_code: Option<String>,
    /// The date the transaction occurred (or posted).
    pub date: Date,
    /// The date the transaction was authorized, when reported.
    #[serde(default)]
    pub authorized_date: Option<Date>,
    /// The raw descriptor line.
    #[serde(default)]
    pub name: Option<String>,
    /// The cleaned-up merchant name, when the aggregator resolved one.
    #[serde(default)]
    pub merchant_name: Option<String>,
    /// Whether the transaction is still pending.
    #[serde(default)]
    pub pending: bool,
    /// The aggregator's category hierarchy, most general first.
    #[serde(default)]
    pub category: Option<Vec<String>>,
    /// Where the transaction took place, when reported.
    #[serde(default)]
    pub location: Option<ProviderLocation>,
}

/// The location block attached to some transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderLocation {
    /// City name.
    #[serde(default)]
    pub city: Option<String>,
    /// Region or state code.
    #[serde(default)]
    pub region: Option<String>,
    /// ISO country code.
    #[serde(default)]
    pub country: Option<String>,
}

/// One bank account as reported by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    /// The aggregator's stable id for this account.
    pub account_id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Last digits of the account number.
    #[serde(default)]
    pub mask: Option<String>,
    /// Account type, e.g. "depository" or "credit".
    #[serde(default, rename = "type")]
    pub account_type: Option<String>,
    /// Balance snapshot taken when the response was produced.
    pub balances: ProviderBalances,
}

/// A balance snapshot for one account.
///
/// Fields the institution does not report come through as null and must be
/// stored as null, not zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderBalances {
    /// The current balance in major currency units.
    #[serde(default)]
    pub current: Option<f64>,
    /// The available balance in major currency units.
    #[serde(default)]
    pub available: Option<f64>,
    /// ISO-4217 currency code, when known.
    #[serde(default)]
    pub iso_currency_code: Option<String>,
}

/// Display metadata for an institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstitution {
    /// The aggregator's id for the institution.
    pub institution_id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// The institution's primary website, when known.
    #[serde(default)]
    pub url: Option<String>,
}

impl ProviderTransaction {
    /// The best available human-readable descriptor: the resolved merchant
    /// name when present, otherwise the raw descriptor line.
    pub fn descriptor(&self) -> Option<&str> {
        self.merchant_name.as_deref().or(self.name.as_deref())
    }

    /// The most specific category label, when the aggregator provided any.
    pub fn leaf_category(&self) -> Option<&str> {
        self.category
            .as_ref()
            .and_then(|levels| levels.last())
            .map(String::as_str)
    }
}
