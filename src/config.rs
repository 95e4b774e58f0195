use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};
use crate::models::DEFAULT_PRELIMINARY_MARKER;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Everything that is specific to the bank's web portal.
///
/// The bank's internal endpoints and markup are not a public contract, so all of
/// it is overridable from `[bank]` without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BankConfig {
    /// Page where the login flow starts.
    pub login_url: String,

    /// Base URL for the structured account/transaction endpoints.
    pub api_base: String,

    /// URL fragment identifying the BankID initialization response.
    pub init_endpoint: String,

    /// URL fragment identifying the BankID poll response.
    pub poll_endpoint: String,

    pub accounts_path: String,
    /// Tried once when `accounts_path` answers 401/403.
    pub accounts_alt_path: String,

    /// `{account}` is replaced by the account number.
    pub transactions_path: String,
    pub transactions_alt_path: String,

    /// Rendered pages used by the page-scrape fallback.
    pub accounts_page_path: String,
    pub transactions_page_path: String,

    pub identity_selector: String,
    pub submit_selector: String,

    /// Two known variants of the "BankID on another device" control.
    pub other_device_selectors: Vec<String>,
    /// Two known variants of the "BankID on this device" control.
    pub same_device_selectors: Vec<String>,

    /// Elements only present once logged in.
    pub logged_in_selectors: Vec<String>,

    /// Path segments that mark a URL as part of the login flow.
    pub login_url_markers: Vec<String>,

    /// Path segments that only appear inside the authenticated area.
    pub authenticated_path_markers: Vec<String>,

    /// Payee prefix for transactions that have not settled.
    pub preliminary_marker: String,

    /// Page text indicating the login attempt or QR code expired.
    pub expiry_text_markers: Vec<String>,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            login_url: "https://secure.bank.example/logon/bankid".to_string(),
            api_base: "https://secure.bank.example".to_string(),
            init_endpoint: "/bankid/init".to_string(),
            poll_endpoint: "/bankid/authenticate".to_string(),
            accounts_path: "/api/accounts/v2/list".to_string(),
            accounts_alt_path: "/api/accounts/v1/overview".to_string(),
            transactions_path: "/api/accounts/v2/{account}/transactions".to_string(),
            transactions_alt_path: "/api/accounts/v1/{account}/transactions".to_string(),
            accounts_page_path: "/app/accounts".to_string(),
            transactions_page_path: "/app/accounts/{account}/transactions".to_string(),
            identity_selector: "input[name='personalNumber'], input#personnummer".to_string(),
            submit_selector: "button[type='submit']".to_string(),
            other_device_selectors: strings(&[
                "button[data-test-id='bankid-other-device']",
                "a[href*='mbidqr']",
            ]),
            same_device_selectors: strings(&[
                "button[data-test-id='bankid-same-device']",
                "a[href*='mbidsame']",
            ]),
            logged_in_selectors: strings(&[
                "[data-test-id='logout']",
                "a[href*='logout']",
                "button[class*='logout']",
                "[class*='account-balance']",
                "[class*='accountList']",
                "[class*='greeting']",
            ]),
            login_url_markers: strings(&["login", "logon", "bankid"]),
            authenticated_path_markers: strings(&["/app/", "/overview", "/accounts"]),
            preliminary_marker: DEFAULT_PRELIMINARY_MARKER.to_string(),
            expiry_text_markers: strings(&[
                "session has expired",
                "qr code has expired",
                "sessionen har gått ut",
                "qr-koden har gått ut",
            ]),
        }
    }
}

impl BankConfig {
    /// Join a configured path onto `api_base`, substituting `{account}`.
    pub fn api_url(&self, path: &str, account_number: Option<&str>) -> String {
        let path = match account_number {
            Some(number) => path.replace("{account}", &urlencoding::encode(number)),
            None => path.to_string(),
        };
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }
}

/// What the success detector's ceiling means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Reaching the ceiling is an error.
    #[default]
    Strict,
    /// Reaching the ceiling is treated as a successful login.
    Permissive,
}

fn default_success_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_navigation_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_device_mode_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Login flow timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(
        default = "default_success_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub success_timeout: Duration,

    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,

    /// Pause after a navigation before probing the page.
    #[serde(
        default = "default_navigation_settle",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub navigation_settle: Duration,

    /// How long to look for the device-mode control.
    #[serde(
        default = "default_device_mode_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub device_mode_timeout: Duration,

    pub timeout_policy: TimeoutPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            success_timeout: default_success_timeout(),
            poll_interval: default_poll_interval(),
            navigation_settle: default_navigation_settle(),
            device_mode_timeout: default_device_mode_timeout(),
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

fn default_auth_confirm_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_page_size() -> u32 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Ceiling for waiting until the browser leaves the login area. Expiring
    /// only logs a warning.
    #[serde(
        default = "default_auth_confirm_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub auth_confirm_timeout: Duration,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            auth_confirm_timeout: default_auth_confirm_timeout(),
            page_size: default_page_size(),
        }
    }
}

/// Chrome launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Chrome/Chromium executable. Located automatically when unset.
    pub chrome_path: Option<PathBuf>,
    /// Profile directory. A temporary profile is used when unset.
    pub profile_dir: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            profile_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeeplinkConfig {
    pub host: String,
    pub native_scheme: String,
}

impl Default for DeeplinkConfig {
    fn default() -> Self {
        Self {
            host: "app.bankid.com".to_string(),
            native_scheme: "bankid".to_string(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bank: BankConfig,
    pub auth: AuthConfig,
    pub retrieval: RetrievalConfig,
    pub browser: BrowserSettings,
    pub deeplink: DeeplinkConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./bankfetch.toml` if it exists in current directory
/// 2. `<data_dir>/bankfetch/bankfetch.toml` (e.g. `~/.local/share` on Linux)
pub fn default_config_path() -> PathBuf {
    resolve_config_path(Path::new("bankfetch.toml"), dirs::data_dir())
}

fn resolve_config_path(local_config: &Path, data_dir: Option<PathBuf>) -> PathBuf {
    if local_config.exists() {
        return local_config.to_path_buf();
    }

    match data_dir {
        Some(data_dir) => data_dir.join("bankfetch").join("bankfetch.toml"),
        None => local_config.to_path_buf(),
    }
}
