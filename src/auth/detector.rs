//! Decides when the bank considers the user logged in.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::browser::{BrowserSession, NavigationEvent};
use crate::config::{AuthConfig, BankConfig};
use crate::error::{BankError, Result};

/// Which signal resolved the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A navigation landed on a page with logged-in markers.
    Navigation(String),
    /// The periodic probe found logged-in markers.
    Poll,
    /// Neither signal fired before the ceiling.
    TimedOut,
}

impl Detection {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Detection::TimedOut)
    }
}

/// URL heuristics shared by the detector and the retrieval auth wait.
#[derive(Debug, Clone)]
pub struct LoginUrlHeuristics {
    login_markers: Vec<String>,
    authenticated_markers: Vec<String>,
}

impl LoginUrlHeuristics {
    pub fn new(bank: &BankConfig) -> Self {
        Self {
            login_markers: bank.login_url_markers.iter().map(|m| m.to_lowercase()).collect(),
            authenticated_markers: bank
                .authenticated_path_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        self.login_markers.iter().any(|m| !m.is_empty() && url.contains(m.as_str()))
    }

    pub fn is_authenticated_area(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        self.authenticated_markers
            .iter()
            .any(|m| !m.is_empty() && url.contains(m.as_str()))
    }

    /// Worth probing after a navigation: outside the login flow, or inside a
    /// known authenticated area.
    pub fn is_candidate(&self, url: &str) -> bool {
        if url.is_empty() || url == "about:blank" {
            return false;
        }
        !self.is_login_url(url) || self.is_authenticated_area(url)
    }
}

/// Session success detector. Resolves at most once per call.
pub struct SuccessDetector {
    urls: LoginUrlHeuristics,
    logged_in_selectors: Vec<String>,
    poll_interval: Duration,
    settle: Duration,
    timeout: Duration,
}

impl SuccessDetector {
    pub fn new(bank: &BankConfig, auth: &AuthConfig) -> Self {
        Self {
            urls: LoginUrlHeuristics::new(bank),
            logged_in_selectors: bank.logged_in_selectors.clone(),
            poll_interval: auth.poll_interval,
            settle: auth.navigation_settle,
            timeout: auth.success_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True if any logged-in marker is on the page. Browser errors count as
    /// "not found".
    pub async fn probe(&self, session: &dyn BrowserSession) -> bool {
        for selector in &self.logged_in_selectors {
            match session.exists(selector).await {
                Ok(true) => {
                    debug!(selector = %selector, "Logged-in marker present");
                    return true;
                }
                Ok(false) => {}
                Err(e) => debug!(selector = %selector, error = %e, "Marker probe failed"),
            }
        }
        false
    }

    /// Race the navigation signal, the periodic probe and the ceiling.
    ///
    /// Timers and the navigation subscription are dropped as soon as one
    /// signal wins.
    pub async fn await_success(
        &self,
        session: &dyn BrowserSession,
        mut navigations: mpsc::UnboundedReceiver<NavigationEvent>,
        cancel: &CancellationToken,
    ) -> Result<Detection> {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut navigation_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BankError::Cancelled),
                _ = &mut deadline => {
                    info!(timeout_secs = self.timeout.as_secs(), "Login success detection timed out");
                    return Ok(Detection::TimedOut);
                }
                event = navigations.recv(), if navigation_open => match event {
                    Some(NavigationEvent { url }) => {
                        if !self.urls.is_candidate(&url) {
                            debug!(url = %url, "Navigation still inside login flow");
                            continue;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(BankError::Cancelled),
                            _ = tokio::time::sleep(self.settle) => {}
                        }
                        if self.probe(session).await {
                            info!(url = %url, "Login confirmed after navigation");
                            return Ok(Detection::Navigation(url));
                        }
                    }
                    None => navigation_open = false,
                },
                _ = ticker.tick() => {
                    if self.probe(session).await {
                        info!("Login confirmed by page probe");
                        return Ok(Detection::Poll);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::MemoryBrowser;

    fn detector() -> SuccessDetector {
        SuccessDetector::new(&BankConfig::default(), &AuthConfig::default())
    }

    #[test]
    fn login_urls_are_not_candidates() {
        let urls = LoginUrlHeuristics::new(&BankConfig::default());
        assert!(!urls.is_candidate("https://secure.bank.example/logon/bankid"));
        assert!(urls.is_candidate("https://secure.bank.example/start"));
        assert!(urls.is_candidate("https://secure.bank.example/logon/app/overview"));
        assert!(!urls.is_candidate("about:blank"));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_to_authenticated_page_resolves() -> Result<()> {
        let browser = MemoryBrowser::new();
        let navigations = browser.subscribe_navigation().await?;
        browser.set_present("[data-test-id='logout']", true);
        browser.emit_navigation("https://secure.bank.example/app/overview");

        let detection = detector()
            .await_success(&browser, navigations, &CancellationToken::new())
            .await?;
        assert_eq!(
            detection,
            Detection::Navigation("https://secure.bank.example/app/overview".to_string())
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poll_catches_spa_transitions() -> Result<()> {
        let browser = MemoryBrowser::new();
        let navigations = browser.subscribe_navigation().await?;
        let page = browser.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            page.set_present("[class*='greeting']", true);
        });

        let started = tokio::time::Instant::now();
        let detection = detector()
            .await_success(&browser, navigations, &CancellationToken::new())
            .await?;
        assert_eq!(detection, Detection::Poll);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn login_navigation_without_markers_waits_for_timeout() -> Result<()> {
        let browser = MemoryBrowser::new();
        let navigations = browser.subscribe_navigation().await?;
        browser.emit_navigation("https://secure.bank.example/logon/bankid?step=2");

        let started = tokio::time::Instant::now();
        let detection = detector()
            .await_success(&browser, navigations, &CancellationToken::new())
            .await?;
        assert_eq!(detection, Detection::TimedOut);
        assert!(!detection.is_confirmed());
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() -> Result<()> {
        let browser = MemoryBrowser::new();
        let navigations = browser.subscribe_navigation().await?;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let result = detector().await_success(&browser, navigations, &cancel).await;
        assert!(matches!(result, Err(BankError::Cancelled)));
        Ok(())
    }
}
