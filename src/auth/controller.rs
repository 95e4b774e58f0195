//! Drives the bank's login UI through one BankID attempt.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::detector::{Detection, SuccessDetector};
use super::extractor::TokenExtractor;
use super::state::{AuthPhase, AuthStateHandle, DeviceMode, StateUpdate};
use crate::browser::BrowserSession;
use crate::config::{AuthConfig, BankConfig, TimeoutPolicy};
use crate::error::{BankError, Result};

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Lists clickable controls for diagnostics when the device-mode control
/// cannot be found.
const LIST_CONTROLS_SCRIPT: &str = r#"Array.from(document.querySelectorAll('button, a, [role="button"], input[type="submit"]')).slice(0, 50).map(el => ({
  tag: el.tagName.toLowerCase(),
  text: (el.innerText || el.value || '').trim().slice(0, 60),
  id: el.id || '',
  class: (typeof el.className === 'string' ? el.className : '').slice(0, 80),
  href: el.getAttribute('href') || ''
}))"#;

pub struct AuthenticationController<'a> {
    session: &'a dyn BrowserSession,
    bank: &'a BankConfig,
    auth: &'a AuthConfig,
    state: &'a AuthStateHandle,
    extractor: TokenExtractor,
    detector: SuccessDetector,
}

impl<'a> AuthenticationController<'a> {
    pub fn new(
        session: &'a dyn BrowserSession,
        bank: &'a BankConfig,
        auth: &'a AuthConfig,
        state: &'a AuthStateHandle,
    ) -> Self {
        Self {
            session,
            bank,
            auth,
            state,
            extractor: TokenExtractor::new(bank),
            detector: SuccessDetector::new(bank, auth),
        }
    }

    /// Run one login attempt.
    ///
    /// Returns `Ok(true)` once the bank shows the authenticated area and
    /// `Ok(false)` when the attempt fails before any token was issued. A
    /// missing device-mode control is an [`BankError::Authentication`].
    pub async fn login(&self, identity: &SecretString, cancel: &CancellationToken) -> Result<bool> {
        // Subscribe before touching the page so the init response is not missed.
        let responses = self.session.subscribe_responses().await?;
        let navigations = self.session.subscribe_navigation().await?;

        if !self.submit_identity(identity).await? {
            self.state.apply(StateUpdate::Phase(AuthPhase::Failed));
            return Ok(false);
        }

        let mode = self.state.snapshot().mode;
        self.select_device_mode(mode).await?;

        let extraction =
            self.extractor
                .run(self.session, responses, self.state, self.auth.poll_interval);
        tokio::pin!(extraction);
        let detection = self.detector.await_success(self.session, navigations, cancel);
        tokio::pin!(detection);

        // The extractor only ends if its stream does; the attempt resolves
        // through the detector alone.
        let mut extraction_done = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut detection => break outcome,
                _ = &mut extraction, if !extraction_done => extraction_done = true,
            }
        };

        match outcome? {
            detection @ (Detection::Navigation(_) | Detection::Poll) => {
                debug!(?detection, "Login detected");
                self.state.apply(StateUpdate::Phase(AuthPhase::Authenticated));
                Ok(true)
            }
            Detection::TimedOut => self.resolve_timeout(),
        }
    }

    fn resolve_timeout(&self) -> Result<bool> {
        if !self.state.token_observed() {
            warn!("No BankID token was issued before the timeout");
            self.state.apply(StateUpdate::Phase(AuthPhase::Failed));
            return Ok(false);
        }
        match self.auth.timeout_policy {
            TimeoutPolicy::Permissive => {
                warn!("Login not confirmed before timeout; continuing as authenticated");
                self.state.apply(StateUpdate::Phase(AuthPhase::Authenticated));
                Ok(true)
            }
            TimeoutPolicy::Strict => {
                self.state.apply(StateUpdate::Phase(AuthPhase::Failed));
                Err(BankError::Timeout {
                    what: "login confirmation",
                    elapsed: self.detector.timeout(),
                })
            }
        }
    }

    /// Type the identity and submit it. `false` when the form is not there.
    async fn submit_identity(&self, identity: &SecretString) -> Result<bool> {
        let selector = &self.bank.identity_selector;
        if !self
            .session
            .wait_for_selector(selector, self.auth.device_mode_timeout)
            .await?
        {
            warn!(selector = %selector, "Identity field not found");
            return Ok(false);
        }

        if let Err(e) = self
            .session
            .type_text(selector, identity.expose_secret())
            .await
        {
            warn!(error = %e, "Could not enter identity");
            return Ok(false);
        }

        // Some variants submit through the device-mode control instead.
        if self.session.exists(&self.bank.submit_selector).await? {
            if let Err(e) = self.session.click(&self.bank.submit_selector).await {
                debug!(error = %e, "Submit control not clickable; relying on device-mode control");
            }
        }
        info!("Identity submitted");
        Ok(true)
    }

    async fn select_device_mode(&self, mode: DeviceMode) -> Result<()> {
        let selectors = match mode {
            DeviceMode::OtherDevice => &self.bank.other_device_selectors,
            DeviceMode::SameDevice => &self.bank.same_device_selectors,
        };

        let Some(selector) = self.resolve_first(selectors).await? else {
            self.report_controls().await;
            return Err(BankError::Authentication(format!(
                "No {mode} control found (tried {})",
                selectors.join(", ")
            )));
        };

        self.session.click(selector).await.map_err(|e| {
            BankError::Authentication(format!("Could not click {mode} control {selector:?}: {e:#}"))
        })?;
        info!(%mode, selector = %selector, "Device mode selected");
        Ok(())
    }

    /// First selector that resolves within the device-mode timeout.
    async fn resolve_first<'s>(&self, selectors: &'s [String]) -> Result<Option<&'s String>> {
        let deadline = tokio::time::Instant::now() + self.auth.device_mode_timeout;
        loop {
            for selector in selectors {
                if self.session.exists(selector).await? {
                    return Ok(Some(selector));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn report_controls(&self) {
        match self.session.evaluate(LIST_CONTROLS_SCRIPT).await {
            Ok(serde_json::Value::Array(controls)) => {
                warn!(count = controls.len(), "Device-mode control missing; controls on page:");
                for control in controls {
                    warn!(control = %control, "Control");
                }
            }
            Ok(other) => warn!(result = %other, "Unexpected control listing"),
            Err(e) => warn!(error = %e, "Could not list page controls"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::state::AuthEvent;
    use crate::browser::memory::{MemoryBrowser, PageEffect};
    use crate::browser::NetworkResponse;
    use tokio::sync::broadcast;

    const IDENTITY: &str = "input[name='personalNumber'], input#personnummer";
    const QR_BUTTON: &str = "button[data-test-id='bankid-other-device']";
    const QR_LINK: &str = "a[href*='mbidqr']";

    fn identity() -> SecretString {
        SecretString::from("199001011234")
    }

    fn login_page() -> MemoryBrowser {
        let browser = MemoryBrowser::new();
        browser.set_present(IDENTITY, true);
        browser
    }

    #[tokio::test(start_paused = true)]
    async fn qr_login_publishes_token_and_succeeds() -> Result<()> {
        let browser = login_page();
        browser.set_present(QR_LINK, true);
        browser.on_click(
            QR_LINK,
            vec![
                PageEffect::Response(NetworkResponse::json(
                    "https://secure.bank.example/bankid/init",
                    r#"{"qrStartToken":"qr-1"}"#,
                )),
                PageEffect::Navigate("https://secure.bank.example/app/overview".to_string()),
                PageEffect::Show("[data-test-id='logout']".to_string()),
            ],
        );

        let (tx, mut rx) = broadcast::channel(16);
        let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
        let bank = BankConfig::default();
        let auth = AuthConfig::default();
        let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

        assert!(controller.login(&identity(), &CancellationToken::new()).await?);
        assert_eq!(state.snapshot().phase, AuthPhase::Authenticated);
        assert_eq!(rx.try_recv().ok(), Some(AuthEvent::QrTokenUpdated("qr-1".to_string())));
        assert_eq!(browser.typed(), vec![(IDENTITY.to_string(), "199001011234".to_string())]);
        assert_eq!(browser.clicks(), vec![QR_LINK.to_string()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_mode_control_is_fatal() {
        let browser = login_page();
        browser.set_evaluation("querySelectorAll", serde_json::json!([{"tag": "button"}]));
        let (tx, _rx) = broadcast::channel(16);
        let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
        let bank = BankConfig::default();
        let auth = AuthConfig::default();
        let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

        let started = tokio::time::Instant::now();
        let result = controller.login(&identity(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BankError::Authentication(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(browser.clicks().is_empty());
        assert_eq!(
            browser
                .evaluated()
                .iter()
                .filter(|script| script.as_str() == LIST_CONTROLS_SCRIPT)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unclickable_device_mode_control_is_fatal() {
        let browser = login_page();
        browser.set_present(QR_BUTTON, true);
        browser.break_click(QR_BUTTON);
        let (tx, _rx) = broadcast::channel(16);
        let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
        let bank = BankConfig::default();
        let auth = AuthConfig::default();
        let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

        let result = controller.login(&identity(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BankError::Authentication(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_identity_field_is_recoverable() -> Result<()> {
        let browser = MemoryBrowser::new();
        let (tx, _rx) = broadcast::channel(16);
        let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
        let bank = BankConfig::default();
        let auth = AuthConfig::default();
        let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

        assert!(!controller.login(&identity(), &CancellationToken::new()).await?);
        assert_eq!(state.snapshot().phase, AuthPhase::Failed);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_token_depends_on_policy() -> Result<()> {
        for (policy, expect_ok) in [(TimeoutPolicy::Strict, false), (TimeoutPolicy::Permissive, true)] {
            let browser = login_page();
            browser.set_present(QR_BUTTON, true);
            browser.on_click(
                QR_BUTTON,
                vec![PageEffect::Response(NetworkResponse::json(
                    "https://secure.bank.example/bankid/init",
                    r#"{"qrStartToken":"qr-1"}"#,
                ))],
            );
            let (tx, _rx) = broadcast::channel(16);
            let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
            let bank = BankConfig::default();
            let auth = AuthConfig {
                timeout_policy: policy,
                ..AuthConfig::default()
            };
            let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

            let result = controller.login(&identity(), &CancellationToken::new()).await;
            if expect_ok {
                assert!(result?);
            } else {
                assert!(matches!(result, Err(BankError::Timeout { .. })));
            }
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_token_returns_false() -> Result<()> {
        let browser = login_page();
        browser.set_present(QR_BUTTON, true);
        let (tx, _rx) = broadcast::channel(16);
        let state = AuthStateHandle::new(DeviceMode::OtherDevice, tx);
        let bank = BankConfig::default();
        let auth = AuthConfig::default();
        let controller = AuthenticationController::new(&browser, &bank, &auth, &state);

        assert!(!controller.login(&identity(), &CancellationToken::new()).await?);
        Ok(())
    }
}
