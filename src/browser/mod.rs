//! Browser capability used by the login flow and the page-scrape fallback.
//!
//! The rest of the crate only sees [`BrowserSession`]; the Chrome DevTools
//! implementation lives in [`chrome`] and a scripted in-memory one in
//! [`memory`].

#[cfg(feature = "chrome")]
pub mod chrome;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A network response observed by the page.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub url: String,
    pub status: u16,
    pub mime_type: String,
    /// Body text, when the browser could provide it.
    pub body: Option<String>,
}

impl NetworkResponse {
    pub fn json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            mime_type: "application/json".to_string(),
            body: Some(body.into()),
        }
    }

    /// Parsed JSON body, `None` for non-JSON or malformed payloads.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        let body = self.body.as_deref()?;
        serde_json::from_str(body).ok()
    }
}

/// A top-level navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Join cookies into a `Cookie` header value.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One controllable page in a browser.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<Option<String>>;

    /// Wait until `selector` matches an element. Returns `false` if it never
    /// appears within `timeout`.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Rendered HTML of the current document.
    async fn content(&self) -> Result<String>;

    async fn cookies(&self) -> Result<Vec<Cookie>>;

    /// Responses received after this call, in arrival order.
    async fn subscribe_responses(&self) -> Result<mpsc::UnboundedReceiver<NetworkResponse>>;

    /// Top-level navigations committed after this call.
    async fn subscribe_navigation(&self) -> Result<mpsc::UnboundedReceiver<NavigationEvent>>;

    /// Tear the browser down. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    async fn exists(&self, selector: &str) -> Result<bool> {
        self.wait_for_selector(selector, Duration::ZERO).await
    }

    /// Visible text of the document body.
    async fn body_text(&self) -> Result<String> {
        let value = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

/// Starts a fresh browser session for one client operation.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_joins_pairs() {
        let cookies = vec![
            Cookie {
                name: "SESSION".to_string(),
                value: "abc".to_string(),
                domain: None,
            },
            Cookie {
                name: "csrf".to_string(),
                value: "1".to_string(),
                domain: Some("bank.test".to_string()),
            },
        ];
        assert_eq!(cookie_header(&cookies), "SESSION=abc; csrf=1");
    }

    #[test]
    fn json_body_ignores_malformed_payloads() {
        let ok = NetworkResponse::json("https://x/init", r#"{"a":1}"#);
        assert_eq!(ok.json_body(), Some(serde_json::json!({"a": 1})));

        let broken = NetworkResponse::json("https://x/init", "<html>");
        assert_eq!(broken.json_body(), None);

        let empty = NetworkResponse {
            body: None,
            ..ok
        };
        assert_eq!(empty.json_body(), None);
    }
}
