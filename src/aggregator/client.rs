//! HTTP client for the aggregator REST API.
//!
//! Each operation is a single request/response pair. Errors surface the
//! aggregator's structured error code/type/message untouched so the sync
//! orchestrator can branch on known codes; retry policy lives with the
//! caller, never in here.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use time::Date;

use super::{
    BankDataProvider,
    models::{ProviderAccount, ProviderInstitution, ProviderTransaction},
};

/// Timeout applied to every aggregator request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for the transactions endpoint.
const TRANSACTIONS_PAGE_SIZE: u32 = 500;

/// How much of an unparseable error body to keep in the error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// The aggregator environment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorEnv {
    /// Test environment with simulated institutions.
    Sandbox,
    /// Development environment with live institutions and test quotas.
    Development,
    /// Live environment.
    Production,
}

impl AggregatorEnv {
    /// The base URL for this environment.
    pub fn base_url(&self) -> &'static str {
        match self {
            AggregatorEnv::Sandbox => "https://sandbox.plaid.com",
            AggregatorEnv::Development => "https://development.plaid.com",
            AggregatorEnv::Production => "https://production.plaid.com",
        }
    }
}

impl FromStr for AggregatorEnv {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "sandbox" => Ok(AggregatorEnv::Sandbox),
            "development" => Ok(AggregatorEnv::Development),
            "production" => Ok(AggregatorEnv::Production),
            other => Err(format!(
                "\"{other}\" is not an aggregator environment \
                (expected sandbox, development or production)"
            )),
        }
    }
}

/// Errors from talking to the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// The request could not be sent or the response body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A 2xx response body did not match the expected shape.
    #[error("could not decode aggregator response: {0}")]
    Json(#[from] serde_json::Error),

    /// A structured error response from the aggregator, passed through
    /// untouched.
    #[error("aggregator error {error_code} ({error_type}): {message}")]
    Api {
        /// The aggregator's error class, e.g. "ITEM_ERROR".
        error_type: String,
        /// The specific error code, e.g. "ITEM_LOGIN_REQUIRED".
        error_code: String,
        /// The human-readable message from the aggregator.
        message: String,
    },
}

impl AggregatorError {
    /// Whether this error means the stored access token is no longer usable
    /// and the institution needs to be re-linked.
    pub fn is_token_error(&self) -> bool {
        match self {
            AggregatorError::Api { error_code, .. } => matches!(
                error_code.as_str(),
                "INVALID_ACCESS_TOKEN" | "ITEM_LOGIN_REQUIRED" | "ITEM_NOT_FOUND"
            ),
            _ => false,
        }
    }
}

/// The shape of the aggregator's error bodies.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error_type: String,
    error_code: String,
    #[serde(default)]
    display_message: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: Vec<ProviderTransaction>,
    total_transactions: u32,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<ProviderAccount>,
}

#[derive(Debug, Deserialize)]
struct InstitutionResponse {
    institution: ProviderInstitution,
}

/// Thin client over the aggregator's HTTP API.
#[derive(Clone)]
pub struct AggregatorClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl std::fmt::Debug for AggregatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorClient")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl AggregatorClient {
    /// Create a client for `env` with the given API credentials.
    pub fn new(env: AggregatorEnv, client_id: &str, secret: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: env.base_url().to_owned(),
            client_id: client_id.to_owned(),
            secret: secret.to_owned(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        mut body: serde_json::Value,
    ) -> Result<T, AggregatorError> {
        let fields = body
            .as_object_mut()
            .expect("aggregator request bodies are JSON objects");
        fields.insert("client_id".to_owned(), json!(self.client_id));
        fields.insert("secret".to_owned(), json!(self.secret));

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(parse_api_error(status.as_u16(), &text));
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn get_transactions_page(
        &self,
        access_token: &str,
        start_date: Date,
        end_date: Date,
        offset: u32,
    ) -> Result<TransactionsResponse, AggregatorError> {
        self.post(
            "/transactions/get",
            json!({
                "access_token": access_token,
                "start_date": start_date,
                "end_date": end_date,
                "options": {
                    "count": TRANSACTIONS_PAGE_SIZE,
                    "offset": offset,
                },
            }),
        )
        .await
    }
}

#[async_trait]
impl BankDataProvider for AggregatorClient {
    async fn refresh_transactions(&self, access_token: &str) -> Result<(), AggregatorError> {
        let _: serde_json::Value = self
            .post(
                "/transactions/refresh",
                json!({ "access_token": access_token }),
            )
            .await?;

        Ok(())
    }

    async fn get_transactions(
        &self,
        access_token: &str,
        start_date: Date,
        end_date: Date,
    ) -> Result<Vec<ProviderTransaction>, AggregatorError> {
        let mut transactions = Vec::new();

        loop {
            let page = self
                .get_transactions_page(access_token, start_date, end_date, transactions.len() as u32)
                .await?;

            let page_was_empty = page.transactions.is_empty();
            transactions.extend(page.transactions);

            if page_was_empty || transactions.len() as u32 >= page.total_transactions {
                break;
            }
        }

        Ok(transactions)
    }

    async fn get_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, AggregatorError> {
        let response: AccountsResponse = self
            .post(
                "/accounts/balance/get",
                json!({ "access_token": access_token }),
            )
            .await?;

        Ok(response.accounts)
    }

    async fn get_institution_metadata(
        &self,
        institution_external_id: &str,
    ) -> Result<ProviderInstitution, AggregatorError> {
        let response: InstitutionResponse = self
            .post(
                "/institutions/get_by_id",
                json!({
                    "institution_id": institution_external_id,
                    "country_codes": ["US"],
                }),
            )
            .await?;

        Ok(response.institution)
    }
}

/// Turn a non-2xx response body into an [AggregatorError::Api], preserving
/// the aggregator's structured fields when the body parses.
fn parse_api_error(status: u16, body: &str) -> AggregatorError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(error_body) => AggregatorError::Api {
            error_type: error_body.error_type,
            error_code: error_body.error_code,
            message: error_body
                .display_message
                .or(error_body.error_message)
                .unwrap_or_default(),
        },
        Err(_) => AggregatorError::Api {
            error_type: "API_ERROR".to_owned(),
            error_code: format!("HTTP_{status}"),
            message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        },
    }
}

#[cfg(test)]
mod aggregator_env_tests {
    use super::AggregatorEnv;

    #[test]
    fn parses_known_environments() {
        assert_eq!("sandbox".parse(), Ok(AggregatorEnv::Sandbox));
        assert_eq!("development".parse(), Ok(AggregatorEnv::Development));
        assert_eq!("production".parse(), Ok(AggregatorEnv::Production));
    }

    #[test]
    fn rejects_unknown_environment() {
        assert!("staging".parse::<AggregatorEnv>().is_err());
    }

    #[test]
    fn base_url_matches_environment() {
        assert_eq!(
            AggregatorEnv::Sandbox.base_url(),
            "https://sandbox.plaid.com"
        );
    }
}
