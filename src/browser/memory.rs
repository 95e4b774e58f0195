//! Scripted in-memory browser for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BrowserLauncher, BrowserSession, Cookie, NavigationEvent, NetworkResponse};

const WAIT_STEP: Duration = Duration::from_millis(100);

/// Something the page does in reaction to a click.
#[derive(Debug, Clone)]
pub enum PageEffect {
    Response(NetworkResponse),
    Navigate(String),
    Show(String),
}

#[derive(Default)]
struct Inner {
    url: Option<String>,
    present: HashSet<String>,
    pages: HashMap<String, String>,
    content: String,
    evaluations: Vec<(String, serde_json::Value)>,
    evaluated: Vec<String>,
    cookies: Vec<Cookie>,
    cookies_broken: bool,
    on_click: HashMap<String, Vec<PageEffect>>,
    broken_clicks: HashSet<String>,
    clicks: Vec<String>,
    typed: Vec<(String, String)>,
    visited: Vec<String>,
    response_subscribers: Vec<mpsc::UnboundedSender<NetworkResponse>>,
    navigation_subscribers: Vec<mpsc::UnboundedSender<NavigationEvent>>,
    close_count: usize,
}

/// In-memory [`BrowserSession`] driven by the test that owns it.
#[derive(Clone, Default)]
pub struct MemoryBrowser {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory browser lock poisoned")
    }

    /// Make `selector` resolve (or stop resolving).
    pub fn set_present(&self, selector: &str, present: bool) {
        let mut inner = self.lock();
        if present {
            inner.present.insert(selector.to_string());
        } else {
            inner.present.remove(selector);
        }
    }

    /// HTML served when `url` is navigated to.
    pub fn set_page(&self, url: &str, html: &str) {
        self.lock().pages.insert(url.to_string(), html.to_string());
    }

    /// Return `value` for any evaluated script containing `needle`.
    pub fn set_evaluation(&self, needle: &str, value: serde_json::Value) {
        let mut inner = self.lock();
        inner.evaluations.retain(|(n, _)| n != needle);
        inner.evaluations.push((needle.to_string(), value));
    }

    pub fn set_cookies(&self, cookies: Vec<Cookie>) {
        self.lock().cookies = cookies;
    }

    /// Reading cookies fails from now on.
    pub fn break_cookies(&self) {
        self.lock().cookies_broken = true;
    }

    /// Effects applied, in order, whenever `selector` is clicked.
    pub fn on_click(&self, selector: &str, effects: Vec<PageEffect>) {
        self.lock().on_click.insert(selector.to_string(), effects);
    }

    /// Clicking `selector` fails even though it resolves.
    pub fn break_click(&self, selector: &str) {
        self.lock().broken_clicks.insert(selector.to_string());
    }

    /// Deliver a response to current subscribers.
    pub fn emit_response(&self, response: NetworkResponse) {
        let mut inner = self.lock();
        inner
            .response_subscribers
            .retain(|tx| tx.send(response.clone()).is_ok());
    }

    /// Commit a top-level navigation without going through `navigate`.
    pub fn emit_navigation(&self, url: &str) {
        let mut inner = self.lock();
        Self::commit_navigation(&mut inner, url);
    }

    fn commit_navigation(inner: &mut Inner, url: &str) {
        inner.url = Some(url.to_string());
        inner.visited.push(url.to_string());
        if let Some(html) = inner.pages.get(url).cloned() {
            inner.content = html;
        }
        let event = NavigationEvent {
            url: url.to_string(),
        };
        inner
            .navigation_subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn apply(inner: &mut Inner, effect: PageEffect) {
        match effect {
            PageEffect::Response(response) => inner
                .response_subscribers
                .retain(|tx| tx.send(response.clone()).is_ok()),
            PageEffect::Navigate(url) => Self::commit_navigation(inner, &url),
            PageEffect::Show(selector) => {
                inner.present.insert(selector);
            }
        }
    }

    pub fn clicks(&self) -> Vec<String> {
        self.lock().clicks.clone()
    }

    /// Scripts passed to `evaluate`, in order.
    pub fn evaluated(&self) -> Vec<String> {
        self.lock().evaluated.clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.lock().typed.clone()
    }

    /// Every URL the page has been on, in order.
    pub fn visited(&self) -> Vec<String> {
        self.lock().visited.clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl BrowserSession for MemoryBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.close_count > 0 {
            anyhow::bail!("Browser is closed");
        }
        Self::commit_navigation(&mut inner, url);
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>> {
        Ok(self.lock().url.clone())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let present = self.lock().present.contains(selector);
            if present {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.present.contains(selector) {
            anyhow::bail!("No element matches {selector:?}");
        }
        if inner.broken_clicks.contains(selector) {
            anyhow::bail!("Element {selector:?} is not clickable");
        }
        inner.clicks.push(selector.to_string());
        let effects = inner.on_click.get(selector).cloned().unwrap_or_default();
        for effect in effects {
            Self::apply(&mut inner, effect);
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.present.contains(selector) {
            anyhow::bail!("No element matches {selector:?}");
        }
        inner.typed.push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let mut inner = self.lock();
        inner.evaluated.push(script.to_string());
        Ok(inner
            .evaluations
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, value)| value.clone())
            .unwrap_or(serde_json::Value::Null))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.lock().content.clone())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let inner = self.lock();
        if inner.cookies_broken {
            anyhow::bail!("Cookie store unavailable");
        }
        Ok(inner.cookies.clone())
    }

    async fn subscribe_responses(&self) -> Result<mpsc::UnboundedReceiver<NetworkResponse>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().response_subscribers.push(tx);
        Ok(rx)
    }

    async fn subscribe_navigation(&self) -> Result<mpsc::UnboundedReceiver<NavigationEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().navigation_subscribers.push(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.close_count += 1;
        inner.response_subscribers.clear();
        inner.navigation_subscribers.clear();
        Ok(())
    }
}

/// Hands out the same [`MemoryBrowser`] on every launch.
#[derive(Clone, Default)]
pub struct MemoryLauncher {
    browser: MemoryBrowser,
    launches: Arc<Mutex<usize>>,
}

impl MemoryLauncher {
    pub fn new(browser: MemoryBrowser) -> Self {
        Self {
            browser,
            launches: Arc::new(Mutex::new(0)),
        }
    }

    pub fn launches(&self) -> usize {
        *self.launches.lock().expect("launch counter lock poisoned")
    }
}

#[async_trait]
impl BrowserLauncher for MemoryLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>> {
        *self.launches.lock().expect("launch counter lock poisoned") += 1;
        Ok(Arc::new(self.browser.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn click_effects_reach_subscribers() -> Result<()> {
        let browser = MemoryBrowser::new();
        browser.set_present("#go", true);
        browser.on_click(
            "#go",
            vec![
                PageEffect::Response(NetworkResponse::json("https://x/a", "{}")),
                PageEffect::Navigate("https://x/home".to_string()),
                PageEffect::Show("#logout".to_string()),
            ],
        );

        let mut responses = browser.subscribe_responses().await?;
        let mut navigations = browser.subscribe_navigation().await?;
        browser.click("#go").await?;

        assert_eq!(responses.recv().await.map(|r| r.url), Some("https://x/a".to_string()));
        assert_eq!(
            navigations.recv().await.map(|n| n.url),
            Some("https://x/home".to_string())
        );
        assert!(browser.exists("#logout").await?);
        assert_eq!(browser.clicks(), vec!["#go".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_broken_controls_fail_to_click() {
        let browser = MemoryBrowser::new();
        assert!(browser.click("#missing").await.is_err());
        browser.set_present("#broken", true);
        browser.break_click("#broken");
        assert!(browser.click("#broken").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_selector_times_out() -> Result<()> {
        let browser = MemoryBrowser::new();
        assert!(!browser.wait_for_selector("#x", Duration::from_secs(1)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn navigation_serves_registered_pages() -> Result<()> {
        let browser = MemoryBrowser::new();
        browser.set_page("https://x/accounts", "<table></table>");
        browser.navigate("https://x/accounts").await?;
        assert_eq!(browser.content().await?, "<table></table>");
        assert_eq!(browser.current_url().await?.as_deref(), Some("https://x/accounts"));
        browser.close().await?;
        assert!(browser.navigate("https://x/").await.is_err());
        Ok(())
    }
}
