//! The bank client: one browser session per operation, driven through
//! `idle -> authenticating -> authenticated -> retrieving -> done`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthEvent, AuthStateHandle, AuthenticationController, AuthenticationState, DeviceMode};
use crate::browser::{BrowserLauncher, BrowserSession};
use crate::config::Config;
use crate::dedup::{DeduplicationOutcome, Deduplicator};
use crate::error::{BankError, Result};
use crate::models::{Account, Transaction};
use crate::retrieval::Retriever;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Idle,
    Authenticating,
    Authenticated,
    Retrieving,
    Done,
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Idle => "idle",
            ClientState::Authenticating => "authenticating",
            ClientState::Authenticated => "authenticated",
            ClientState::Retrieving => "retrieving",
            ClientState::Done => "done",
            ClientState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BankError::Cancelled),
        result = fut => result,
    }
}

/// Orchestrates login, account selection, retrieval and reconciliation.
pub struct BankClient<L: BrowserLauncher> {
    config: Config,
    launcher: L,
    state: ClientState,
    session: Option<Arc<dyn BrowserSession>>,
    auth: Option<AuthStateHandle>,
    account: Option<Account>,
    existing: Vec<Transaction>,
    events: broadcast::Sender<AuthEvent>,
    cancel: CancellationToken,
}

impl<L: BrowserLauncher> BankClient<L> {
    pub fn new(config: Config, launcher: L) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            launcher,
            state: ClientState::Idle,
            session: None,
            auth: None,
            account: None,
            existing: Vec::new(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Existing ledger transactions used by [`BankClient::fetch_and_reconcile`].
    pub fn with_existing_transactions(mut self, existing: Vec<Transaction>) -> Self {
        self.existing = existing;
        self
    }

    pub fn set_existing_transactions(&mut self, existing: Vec<Transaction>) {
        self.existing = existing;
    }

    /// Token and expiry notifications for the current login attempt.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Cancelling the token aborts the running operation with
    /// [`BankError::Cancelled`]. It stays cancelled for this client.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn selected_account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    /// State of the login attempt, while its session is open.
    pub fn auth_state(&self) -> Option<AuthenticationState> {
        self.auth.as_ref().map(AuthStateHandle::snapshot)
    }

    fn require(&self, operation: &'static str, expected: ClientState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BankError::SessionState {
                operation,
                state: self.state,
            })
        }
    }

    fn session(&self, operation: &'static str) -> Result<Arc<dyn BrowserSession>> {
        self.session.clone().ok_or(BankError::SessionState {
            operation,
            state: self.state,
        })
    }

    /// Launch a browser, log in and select the account to fetch from.
    pub async fn initialize(
        &mut self,
        identity: &SecretString,
        account_selector: &str,
        mode: DeviceMode,
    ) -> Result<()> {
        self.require("initialize", ClientState::Idle)?;
        self.state = ClientState::Authenticating;

        let cancel = self.cancel.clone();
        let result = cancellable(&cancel, async {
            self.open_session().await?;
            self.authenticate(identity, mode, &cancel).await?;
            self.select_account(account_selector).await
        })
        .await;

        if let Err(e) = &result {
            warn!(error = %e, "Initialization failed");
            self.fail().await;
        }
        result
    }

    async fn open_session(&mut self) -> Result<()> {
        let session = self.launcher.launch().await?;
        self.session = Some(session.clone());
        session.navigate(&self.config.bank.login_url).await?;
        Ok(())
    }

    /// One login attempt on the open session.
    pub async fn authenticate(
        &mut self,
        identity: &SecretString,
        mode: DeviceMode,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.require("authenticate", ClientState::Authenticating)?;
        let session = self.session("authenticate")?;

        let handle = AuthStateHandle::new(mode, self.events.clone());
        let logged_in = {
            let controller = AuthenticationController::new(
                session.as_ref(),
                &self.config.bank,
                &self.config.auth,
                &handle,
            );
            controller.login(identity, cancel).await
        };
        self.auth = Some(handle);

        if !logged_in? {
            return Err(BankError::Authentication(
                "BankID login did not complete".to_string(),
            ));
        }
        self.state = ClientState::Authenticated;
        info!(%mode, "Authenticated");
        Ok(())
    }

    /// Pick the account matching `criteria` by display name, official name
    /// or account number.
    pub async fn select_account(&mut self, criteria: &str) -> Result<()> {
        self.require("select account", ClientState::Authenticated)?;
        let session = self.session("select account")?;

        let retriever = Retriever::new(session.as_ref(), &self.config.bank, &self.config.retrieval);
        retriever.await_authenticated().await?;
        let accounts = retriever.fetch_accounts().await?;

        let Some(account) = accounts.iter().find(|a| a.matches(criteria)) else {
            return Err(BankError::AccountNotFound {
                criteria: criteria.to_string(),
                available: accounts.iter().map(Account::label).collect(),
            });
        };
        info!(account = %account.label(), "Account selected");
        self.account = Some(account.clone());
        Ok(())
    }

    /// Transactions dated within `[from, to]` for the selected account.
    ///
    /// The browser session is released afterwards whatever the outcome.
    pub async fn fetch_transactions(&mut self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Transaction>> {
        if from > to {
            return Err(BankError::InvalidRange { from, to });
        }
        self.require("fetch transactions", ClientState::Authenticated)?;
        let account = self.account.clone().ok_or(BankError::SessionState {
            operation: "fetch transactions",
            state: self.state,
        })?;
        self.state = ClientState::Retrieving;

        let cancel = self.cancel.clone();
        let result = cancellable(&cancel, async {
            let session = self.session("fetch transactions")?;
            let retriever =
                Retriever::new(session.as_ref(), &self.config.bank, &self.config.retrieval);
            retriever.fetch_transactions(&account, from, to).await
        })
        .await;

        match result {
            Ok(transactions) => {
                self.release().await;
                self.state = ClientState::Done;
                info!(count = transactions.len(), %from, %to, "Fetch complete");
                Ok(transactions)
            }
            Err(e) => {
                warn!(error = %e, "Fetch failed");
                self.fail().await;
                Err(e)
            }
        }
    }

    /// Fetch, then reconcile against the existing ledger transactions.
    pub async fn fetch_and_reconcile(
        &mut self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DeduplicationOutcome> {
        let fetched = self.fetch_transactions(from, to).await?;
        let outcome = Deduplicator::new(self.config.bank.preliminary_marker.clone())
            .reconcile(fetched, &self.existing);
        info!(
            import = outcome.transactions_to_import.len(),
            replaced = outcome.replaced_count,
            skipped = outcome.skipped_count,
            errors = outcome.errors.len(),
            "Reconciled"
        );
        Ok(outcome)
    }

    /// Close the browser and return to idle. Safe to call any number of times.
    pub async fn cleanup(&mut self) {
        self.release().await;
        self.account = None;
        self.state = ClientState::Idle;
    }

    async fn fail(&mut self) {
        self.state = ClientState::Failed;
        self.release().await;
    }

    async fn release(&mut self) {
        self.auth = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close browser session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{MemoryBrowser, MemoryLauncher};

    fn client(browser: &MemoryBrowser) -> BankClient<MemoryLauncher> {
        BankClient::new(Config::default(), MemoryLauncher::new(browser.clone()))
    }

    fn identity() -> SecretString {
        SecretString::from("199001011234")
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn states_display_lowercase() {
        assert_eq!(ClientState::Authenticating.to_string(), "authenticating");
        assert_eq!(ClientState::Done.to_string(), "done");
    }

    #[tokio::test]
    async fn fetch_before_initialize_is_a_state_error() {
        let browser = MemoryBrowser::new();
        let mut client = client(&browser);
        let result = client.fetch_transactions(ymd(2024, 1, 1), ymd(2024, 1, 31)).await;
        assert!(matches!(
            result,
            Err(BankError::SessionState {
                state: ClientState::Idle,
                ..
            })
        ));
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected_without_state_change() {
        let browser = MemoryBrowser::new();
        let mut client = client(&browser);
        let result = client.fetch_transactions(ymd(2024, 2, 1), ymd(2024, 1, 31)).await;
        assert!(matches!(result, Err(BankError::InvalidRange { .. })));
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_releases_the_browser() {
        let browser = MemoryBrowser::new();
        let mut client = client(&browser);

        let result = client
            .initialize(&identity(), "Everyday", DeviceMode::OtherDevice)
            .await;
        assert!(matches!(result, Err(BankError::Authentication(_))));
        assert_eq!(client.state(), ClientState::Failed);
        assert!(browser.is_closed());
        assert_eq!(
            browser.visited(),
            vec!["https://secure.bank.example/logon/bankid".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_and_releases() {
        let browser = MemoryBrowser::new();
        browser.set_present("input[name='personalNumber'], input#personnummer", true);
        browser.set_present("a[href*='mbidqr']", true);
        let mut client = client(&browser);
        let cancel = client.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            cancel.cancel();
        });

        let result = client
            .initialize(&identity(), "Everyday", DeviceMode::OtherDevice)
            .await;
        assert!(matches!(result, Err(BankError::Cancelled)));
        assert_eq!(client.state(), ClientState::Failed);
        assert!(browser.is_closed());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let browser = MemoryBrowser::new();
        let mut client = client(&browser);
        client.cleanup().await;
        client.cleanup().await;
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(browser.close_count(), 0);
    }
}
