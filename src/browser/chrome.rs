//! [`BrowserSession`] over the Chrome DevTools Protocol.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams,
};
use chromiumoxide::cdp::browser_protocol::page::EventFrameNavigated;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{BrowserLauncher, BrowserSession, Cookie, NavigationEvent, NetworkResponse};
use crate::config::BrowserSettings;

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Launches a Chrome/Chromium instance per client operation.
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>> {
        let session = ChromeSession::launch(&self.settings).await?;
        Ok(Arc::new(session))
    }
}

/// A single page in a dedicated Chrome process.
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChromeSession {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let chrome_path = match &settings.chrome_path {
            Some(path) => path.display().to_string(),
            None => find_chrome().context(
                "Chrome/Chromium not found. Install Chrome or set browser.chrome_path.",
            )?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(profile_dir) = &settings.profile_dir {
            std::fs::create_dir_all(profile_dir).with_context(|| {
                format!("Failed to create profile dir: {}", profile_dir.display())
            })?;
            builder = builder.user_data_dir(profile_dir);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;
        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = browser.new_page("about:blank").await?;
        page.execute(EnableParams::default())
            .await
            .context("Failed to enable network events")?;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            tasks: StdMutex::new(vec![handler_task]),
        })
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .expect("chrome task list lock poisoned")
            .push(task);
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {url}"))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("No element matches {selector:?}"))?;
        element
            .click()
            .await
            .with_context(|| format!("Failed to click {selector:?}"))?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("No element matches {selector:?}"))?;
        element.click().await?;
        element
            .type_str(text)
            .await
            .with_context(|| format!("Failed to type into {selector:?}"))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script).await?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: Some(c.domain),
            })
            .collect())
    }

    async fn subscribe_responses(&self) -> Result<mpsc::UnboundedReceiver<NetworkResponse>> {
        let mut received = self.page.event_listener::<EventResponseReceived>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;
        let page = self.page.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        // Bodies are only complete once loading finishes, so headers are parked
        // until the matching LoadingFinished event arrives.
        let task = tokio::spawn(async move {
            let mut pending = PendingResponses::default();
            loop {
                tokio::select! {
                    Some(event) = received.next() => {
                        pending.received(
                            event.request_id.inner(),
                            NetworkResponse {
                                url: event.response.url.clone(),
                                status: u16::try_from(event.response.status).unwrap_or(0),
                                mime_type: event.response.mime_type.clone(),
                                body: None,
                            },
                        );
                    }
                    Some(event) = finished.next() => {
                        let Some(mut response) = pending.finished(event.request_id.inner()) else {
                            continue;
                        };
                        if is_textual(&response.mime_type) {
                            response.body = read_body(&page, &event.request_id).await;
                        }
                        if tx.send(response).is_err() {
                            break;
                        }
                    }
                    Some(event) = failed.next() => {
                        if pending.failed(event.request_id.inner()) {
                            tracing::debug!(error = %event.error_text, "Dropping failed response");
                        }
                    }
                    else => break,
                }
            }
        });
        self.track(task);
        Ok(rx)
    }

    async fn subscribe_navigation(&self) -> Result<mpsc::UnboundedReceiver<NavigationEvent>> {
        let mut events = self.page.event_listener::<EventFrameNavigated>().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.frame.parent_id.is_some() {
                    continue;
                }
                let navigation = NavigationEvent {
                    url: event.frame.url.clone(),
                };
                if tx.send(navigation).is_err() {
                    break;
                }
            }
        });
        self.track(task);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                tracing::debug!(error = %e, "Browser close command failed");
            }
            let _ = browser.wait().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("chrome task list lock poisoned"));
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Response headers waiting for their body, keyed by CDP request id.
#[derive(Default)]
struct PendingResponses {
    by_request: HashMap<String, NetworkResponse>,
}

impl PendingResponses {
    fn received(&mut self, request_id: &str, response: NetworkResponse) {
        self.by_request.insert(request_id.to_string(), response);
    }

    fn finished(&mut self, request_id: &str) -> Option<NetworkResponse> {
        self.by_request.remove(request_id)
    }

    /// Forget a request that never completed. Returns whether it was parked.
    fn failed(&mut self, request_id: &str) -> bool {
        self.by_request.remove(request_id).is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_request.len()
    }
}

fn is_textual(mime_type: &str) -> bool {
    mime_type.contains("json") || mime_type.starts_with("text/") || mime_type.contains("javascript")
}

async fn read_body(
    page: &Page,
    request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
) -> Option<String> {
    let response = match page
        .execute(GetResponseBodyParams::new(request_id.clone()))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "Response body unavailable");
            return None;
        }
    };

    if response.base64_encoded {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&response.body)
            .ok()?;
        Some(String::from_utf8_lossy(&decoded).to_string())
    } else {
        Some(response.body.clone())
    }
}

/// Locate a Chrome/Chromium executable.
///
/// `BANKFETCH_CHROME` wins, then whatever `which` finds, then well-known
/// install locations.
pub fn find_chrome() -> Option<String> {
    if let Ok(path) = std::env::var("BANKFETCH_CHROME") {
        if !path.trim().is_empty() {
            return Some(path);
        }
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        let Ok(output) = std::process::Command::new("which").arg(name).output() else {
            continue;
        };
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }
    }

    [
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/snap/bin/chromium",
        "/run/current-system/sw/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ]
    .into_iter()
    .find(|candidate| Path::new(candidate).exists())
    .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str) -> NetworkResponse {
        NetworkResponse::json(url, "{}")
    }

    #[test]
    fn failed_loads_are_not_kept() {
        let mut pending = PendingResponses::default();
        pending.received("1", response("https://bank.test/bankid/init"));
        pending.received("2", response("https://bank.test/bankid/authenticate"));

        assert!(pending.failed("2"));
        assert!(!pending.failed("2"));
        assert_eq!(pending.len(), 1);

        let done = pending.finished("1").map(|r| r.url);
        assert_eq!(done.as_deref(), Some("https://bank.test/bankid/init"));
        assert!(pending.finished("2").is_none());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn textual_mime_types() {
        assert!(is_textual("application/json"));
        assert!(is_textual("text/html"));
        assert!(!is_textual("image/png"));
    }
}
