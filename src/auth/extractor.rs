//! Turns intercepted BankID backend traffic into [`StateUpdate`]s.

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::{AuthPhase, AuthStateHandle, StateUpdate};
use crate::browser::{BrowserSession, NetworkResponse};
use crate::config::BankConfig;

/// Which backend endpoint a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Init,
    Poll,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    #[serde(default)]
    qr_start_token: Option<String>,
    #[serde(default, rename = "_links")]
    links: Option<InitLinks>,
}

#[derive(Debug, Deserialize)]
struct InitLinks {
    #[serde(default)]
    authenticate: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollResult {
    NoClientStarted,
    InProgress,
    QrExpired,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    #[serde(default)]
    result: Option<PollResult>,
    #[serde(default)]
    qr_start_token: Option<String>,
    #[serde(default)]
    auto_start_token: Option<String>,
    #[serde(default)]
    iteration_sleep_time: Option<u64>,
}

/// Token/state extractor for one login attempt.
///
/// It never decides whether the login succeeded; it only keeps
/// [`AuthStateHandle`] current.
pub struct TokenExtractor {
    init_endpoint: String,
    poll_endpoint: String,
    expiry_markers: Vec<String>,
    /// Poll path advertised by the init response's `_links.authenticate`.
    learned_poll_path: Mutex<Option<String>>,
}

impl TokenExtractor {
    pub fn new(bank: &BankConfig) -> Self {
        Self {
            init_endpoint: bank.init_endpoint.clone(),
            poll_endpoint: bank.poll_endpoint.clone(),
            expiry_markers: bank
                .expiry_text_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            learned_poll_path: Mutex::new(None),
        }
    }

    pub fn classify(&self, url: &str) -> Option<Endpoint> {
        if !self.init_endpoint.is_empty() && url.contains(&self.init_endpoint) {
            return Some(Endpoint::Init);
        }
        if !self.poll_endpoint.is_empty() && url.contains(&self.poll_endpoint) {
            return Some(Endpoint::Poll);
        }
        let learned = self
            .learned_poll_path
            .lock()
            .expect("learned poll path lock poisoned");
        match learned.as_deref() {
            Some(path) if url.contains(path) => Some(Endpoint::Poll),
            _ => None,
        }
    }

    /// Apply one intercepted response. Returns the endpoint it was
    /// recognized as, or `None` when it was ignored.
    pub fn handle(&self, response: &NetworkResponse, state: &AuthStateHandle) -> Option<Endpoint> {
        let endpoint = self.classify(&response.url)?;
        if response.status >= 400 {
            debug!(url = %response.url, status = response.status, "Ignoring failed BankID response");
            return None;
        }
        let Some(body) = response.json_body() else {
            debug!(url = %response.url, "Ignoring non-JSON BankID response");
            return None;
        };

        match endpoint {
            Endpoint::Init => {
                let parsed: InitResponse = match serde_json::from_value(body) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed init response");
                        return None;
                    }
                };
                if let Some(href) = parsed.links.and_then(|l| l.authenticate).map(|l| l.href) {
                    let path = url_path(&href).to_string();
                    if !path.is_empty() {
                        *self
                            .learned_poll_path
                            .lock()
                            .expect("learned poll path lock poisoned") = Some(path);
                    }
                }
                if let Some(token) = parsed.qr_start_token.filter(|t| !t.is_empty()) {
                    if state.apply(StateUpdate::QrToken(token)) {
                        info!("Received QR start token");
                    }
                }
            }
            Endpoint::Poll => {
                let parsed: PollResponse = match serde_json::from_value(body) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed poll response");
                        return None;
                    }
                };
                match parsed.result {
                    Some(PollResult::NoClientStarted) => {
                        state.apply(StateUpdate::Phase(AuthPhase::AwaitingScan));
                    }
                    Some(PollResult::InProgress) => {
                        if state.apply(StateUpdate::Phase(AuthPhase::InProgress)) {
                            info!("BankID app opened, waiting for approval");
                        }
                    }
                    Some(PollResult::QrExpired) => {
                        if state.apply(StateUpdate::Expired("The QR code has expired".to_string())) {
                            warn!("BankID QR code expired");
                        }
                    }
                    Some(PollResult::Other) | None => {}
                }
                if let Some(token) = parsed.qr_start_token.filter(|t| !t.is_empty()) {
                    if state.apply(StateUpdate::QrToken(token)) {
                        info!("QR start token rotated");
                    }
                }
                if let Some(token) = parsed.auto_start_token.filter(|t| !t.is_empty()) {
                    if state.apply(StateUpdate::AutoStartToken(token)) {
                        info!("Same-device token available");
                    }
                }
                if let Some(sleep_ms) = parsed.iteration_sleep_time {
                    debug!(sleep_ms, "Backend poll cadence");
                }
            }
        }
        Some(endpoint)
    }

    /// Expiry message if `page_text` contains one of the configured phrases.
    pub fn detect_expiry(&self, page_text: &str) -> Option<String> {
        let text = page_text.to_lowercase();
        self.expiry_markers
            .iter()
            .find(|marker| !marker.is_empty() && text.contains(marker.as_str()))
            .map(|marker| format!("Login expired ({marker})"))
    }

    /// Consume responses until the channel closes, checking the page text for
    /// expiry every `page_check` in between. Errors are logged, never returned.
    pub async fn run(
        &self,
        session: &dyn BrowserSession,
        mut responses: mpsc::UnboundedReceiver<NetworkResponse>,
        state: &AuthStateHandle,
        page_check: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + page_check, page_check);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                response = responses.recv(), if open => match response {
                    Some(response) => {
                        self.handle(&response, state);
                    }
                    None => {
                        debug!("Response stream closed");
                        open = false;
                    }
                },
                _ = ticker.tick() => match session.body_text().await {
                    Ok(text) => {
                        if let Some(message) = self.detect_expiry(&text) {
                            if state.apply(StateUpdate::Expired(message.clone())) {
                                warn!(message = %message, "Login page reports expiry");
                            }
                        }
                    }
                    Err(e) => debug!(error = %e, "Could not read page text"),
                },
            }
        }
    }
}

/// Path (and query) portion of an absolute or relative URL.
fn url_path(href: &str) -> &str {
    match href.find("://") {
        Some(scheme_end) => {
            let rest = &href[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("")
        }
        None => href,
    }
}
