//! Structured account/transaction endpoints, called with the browser's cookies.

use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::records::{
    account_from_record, finish_transactions, record_list, transaction_from_record,
    RawTransaction, ACCOUNT_COLLECTION_KEYS, TRANSACTION_COLLECTION_KEYS,
};
use crate::browser::{cookie_header, Cookie};
use crate::config::BankConfig;
use crate::models::{Account, Transaction};

/// Stop following pages past this many records.
pub const MAX_TRANSACTIONS: usize = 5000;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not authorized ({0})")]
    Unauthorized(StatusCode),

    #[error("Request failed ({status}): {snippet}")]
    Status { status: StatusCode, snippet: String },

    #[error("Response from {url} is not JSON")]
    NotJson { url: String },

    #[error("No record list in response from {url}")]
    UnexpectedShape { url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Paging hints carried next to the record list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default, alias = "moreRecords", alias = "moreRecordsIndicator")]
    has_more: bool,
}

/// Client for the bank's internal JSON API.
pub struct BankApi {
    client: Client,
    bank: BankConfig,
    cookies: String,
    page_size: u32,
}

impl BankApi {
    pub fn new(bank: &BankConfig, cookies: &[Cookie], page_size: u32) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            bank: bank.clone(),
            cookies: cookie_header(cookies),
            page_size: page_size.max(1),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header("accept", "application/json, text/plain, */*")
            .header("x-request-id", uuid::Uuid::new_v4().to_string())
            .header("referer", self.bank.api_url(&self.bank.accounts_page_path, None))
            .header("cookie", &self.cookies)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status,
                snippet: body.chars().take(200).collect(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| ApiError::NotJson {
            url: url.to_string(),
        })
    }

    /// GET `primary`; on 401/403 try `alternate` once.
    async fn get_with_alternate(
        &self,
        primary: &str,
        alternate: &str,
        query: &[(&str, String)],
    ) -> Result<(Value, bool), ApiError> {
        match self.get_json(primary, query).await {
            Err(e) if e.is_unauthorized() && !alternate.is_empty() => {
                warn!(url = %primary, error = %e, "Primary endpoint refused, trying alternate");
                Ok((self.get_json(alternate, query).await?, true))
            }
            other => other.map(|body| (body, false)),
        }
    }

    pub async fn fetch_accounts(&self) -> Result<Vec<Account>, ApiError> {
        let primary = self.bank.api_url(&self.bank.accounts_path, None);
        let alternate = self.bank.api_url(&self.bank.accounts_alt_path, None);
        let (body, _) = self.get_with_alternate(&primary, &alternate, &[]).await?;

        let records = record_list(&body, ACCOUNT_COLLECTION_KEYS)
            .ok_or(ApiError::UnexpectedShape { url: primary })?;
        let accounts: Vec<Account> = records.iter().filter_map(account_from_record).collect();
        if accounts.len() < records.len() {
            debug!(
                skipped = records.len() - accounts.len(),
                "Skipped account records without a number"
            );
        }
        info!(count = accounts.len(), "Fetched accounts");
        Ok(accounts)
    }

    /// All transactions for `account_number` dated within `[from, to]`,
    /// following pages until the bank reports no more or the cap is reached.
    pub async fn fetch_transactions(
        &self,
        account_number: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>, ApiError> {
        let marker = &self.bank.preliminary_marker;
        let primary = self
            .bank
            .api_url(&self.bank.transactions_path, Some(account_number));
        let alternate = self
            .bank
            .api_url(&self.bank.transactions_alt_path, Some(account_number));

        let mut raw: Vec<RawTransaction> = Vec::new();
        let mut url = primary.clone();
        let mut page = 1u32;

        loop {
            let query = [
                ("fromDate", from.to_string()),
                ("toDate", to.to_string()),
                ("page", page.to_string()),
                ("pageSize", self.page_size.to_string()),
            ];
            let body = if page == 1 {
                let (body, used_alternate) =
                    self.get_with_alternate(&primary, &alternate, &query).await?;
                if used_alternate {
                    url = alternate.clone();
                }
                body
            } else {
                self.get_json(&url, &query).await?
            };

            let records = record_list(&body, TRANSACTION_COLLECTION_KEYS)
                .ok_or_else(|| ApiError::UnexpectedShape { url: url.clone() })?;
            let count = records.len();
            raw.extend(
                records
                    .iter()
                    .filter_map(|record| transaction_from_record(record, marker)),
            );

            let info: PageInfo = serde_json::from_value(body).unwrap_or_default();
            debug!(page, count, has_more = info.has_more, "Fetched transaction page");
            if !info.has_more || count == 0 {
                break;
            }
            if raw.len() >= MAX_TRANSACTIONS {
                warn!(
                    count = raw.len(),
                    "Stopping pagination at transaction safety limit"
                );
                break;
            }
            page += 1;
        }

        raw.truncate(MAX_TRANSACTIONS);
        let transactions = finish_transactions(raw, account_number, marker, from, to);
        info!(count = transactions.len(), "Fetched transactions");
        Ok(transactions)
    }
}
