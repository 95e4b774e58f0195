//! Account and transaction retrieval: structured API first, rendered pages
//! as the fallback.

pub mod api;
pub mod fallback;
mod records;

use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

pub use api::{ApiError, BankApi, MAX_TRANSACTIONS};
pub use fallback::{PageScraper, ScrapeStrategy};
pub use records::parse_bank_date;

use crate::auth::LoginUrlHeuristics;
use crate::browser::BrowserSession;
use crate::config::{BankConfig, RetrievalConfig};
use crate::error::{BankError, Result};
use crate::models::{Account, Transaction};

const URL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Structured data retriever with page-scrape fallback, bound to one
/// authenticated browser session.
pub struct Retriever<'a> {
    session: &'a dyn BrowserSession,
    bank: &'a BankConfig,
    settings: &'a RetrievalConfig,
    scraper: PageScraper,
}

impl<'a> Retriever<'a> {
    pub fn new(
        session: &'a dyn BrowserSession,
        bank: &'a BankConfig,
        settings: &'a RetrievalConfig,
    ) -> Self {
        Self {
            session,
            bank,
            settings,
            scraper: PageScraper::new(bank.preliminary_marker.clone()),
        }
    }

    /// Wait for the browser to leave the login area.
    ///
    /// Expiry only logs a warning; retrieval proceeds either way and the
    /// endpoints themselves will refuse an unauthenticated session.
    pub async fn await_authenticated(&self) -> Result<()> {
        let urls = LoginUrlHeuristics::new(self.bank);
        let deadline = tokio::time::Instant::now() + self.settings.auth_confirm_timeout;
        loop {
            let url = self.session.current_url().await?.unwrap_or_default();
            if urls.is_candidate(&url) {
                debug!(url = %url, "Session is outside the login area");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    url = %url,
                    timeout_secs = self.settings.auth_confirm_timeout.as_secs(),
                    "Still on a login page; continuing anyway"
                );
                return Ok(());
            }
            tokio::time::sleep(URL_CHECK_INTERVAL).await;
        }
    }

    async fn api(&self) -> anyhow::Result<BankApi> {
        let cookies = self
            .session
            .cookies()
            .await
            .context("Failed to read session cookies")?;
        BankApi::new(self.bank, &cookies, self.settings.page_size)
    }

    async fn structured_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self.api().await?.fetch_accounts().await?)
    }

    async fn structured_transactions(
        &self,
        number: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<Transaction>> {
        Ok(self.api().await?.fetch_transactions(number, from, to).await?)
    }

    pub async fn fetch_accounts(&self) -> Result<Vec<Account>> {
        let structured = match self.structured_accounts().await {
            Ok(accounts) if !accounts.is_empty() => return Ok(accounts),
            Ok(_) => {
                info!("Account endpoint returned no accounts, reading the page instead");
                None
            }
            Err(e) => {
                warn!(error = format!("{e:#}"), "Account endpoint failed, reading the page instead");
                Some(e)
            }
        };

        let url = self.bank.api_url(&self.bank.accounts_page_path, None);
        let html = self.page(&url).await?;
        let accounts = self.scraper.accounts(&html);
        if accounts.is_empty() {
            let reason = match structured {
                Some(e) => format!("account endpoints failed ({e:#}) and no accounts were found on {url}"),
                None => format!("no accounts returned by the bank or found on {url}"),
            };
            return Err(BankError::Retrieval(reason));
        }
        Ok(accounts)
    }

    /// Transactions for `account` dated within `[from, to]`.
    ///
    /// An empty structured answer is confirmed against the rendered page
    /// before being returned.
    pub async fn fetch_transactions(
        &self,
        account: &Account,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>> {
        if from > to {
            return Err(BankError::InvalidRange { from, to });
        }
        let number = &account.account_number;

        let structured = match self.structured_transactions(number, from, to).await {
            Ok(transactions) if !transactions.is_empty() => return Ok(transactions),
            Ok(_) => {
                info!(account = %number, "Transaction endpoint returned nothing, checking the page");
                None
            }
            Err(e) => {
                warn!(account = %number, error = format!("{e:#}"), "Transaction endpoint failed, reading the page instead");
                Some(e)
            }
        };

        let url = self
            .bank
            .api_url(&self.bank.transactions_page_path, Some(number));
        let html = self.page(&url).await?;
        let transactions = self.scraper.transactions(&html, number, from, to);
        match structured {
            Some(e) if transactions.is_empty() => Err(BankError::Retrieval(format!(
                "transaction endpoints failed ({e:#}) and no transactions were found on {url}"
            ))),
            _ => {
                info!(count = transactions.len(), "Read transactions from page");
                Ok(transactions)
            }
        }
    }

    async fn page(&self, url: &str) -> Result<String> {
        self.session.navigate(url).await?;
        Ok(self.session.content().await?)
    }
}
