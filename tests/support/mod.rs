#![allow(dead_code)]

use std::time::Duration;

use bankfetch::browser::memory::{MemoryBrowser, PageEffect};
use bankfetch::browser::{Cookie, NetworkResponse};
use bankfetch::config::Config;
use chrono::NaiveDate;
use wiremock::MockServer;

pub const QR_TOKEN: &str = "qr-1";
pub const AUTO_START_TOKEN: &str = "auto-1";

pub fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

/// Config aimed at `server` with timings short enough for real-time tests.
pub fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.bank.api_base = server.uri();
    config.bank.login_url = format!("{}/logon/bankid", server.uri());
    config.auth.navigation_settle = Duration::from_millis(10);
    config.auth.poll_interval = Duration::from_millis(50);
    config.auth.success_timeout = Duration::from_secs(5);
    config.auth.device_mode_timeout = Duration::from_millis(500);
    config.retrieval.auth_confirm_timeout = Duration::from_millis(500);
    config
}

pub fn session_cookies() -> Vec<Cookie> {
    vec![Cookie {
        name: "SESSION".to_string(),
        value: "s1".to_string(),
        domain: None,
    }]
}

/// A browser already inside the authenticated area with session cookies.
pub fn logged_in_browser(config: &Config) -> MemoryBrowser {
    let browser = MemoryBrowser::new();
    browser.set_cookies(session_cookies());
    browser.emit_navigation(&format!("{}/app/overview", config.bank.api_base));
    browser
}

/// Login page where choosing "other device" issues a QR token, a same-device
/// token, and then lands in the authenticated area.
pub fn login_browser(config: &Config) -> MemoryBrowser {
    let bank = &config.bank;
    let browser = MemoryBrowser::new();
    browser.set_cookies(session_cookies());
    browser.set_present(&bank.identity_selector, true);

    let other_device = &bank.other_device_selectors[0];
    browser.set_present(other_device, true);
    browser.on_click(
        other_device,
        vec![
            PageEffect::Response(NetworkResponse::json(
                format!("{}{}", bank.api_base, bank.init_endpoint),
                format!(r#"{{"qrStartToken":"{QR_TOKEN}"}}"#),
            )),
            PageEffect::Response(NetworkResponse::json(
                format!("{}{}", bank.api_base, bank.poll_endpoint),
                format!(
                    r#"{{"result":"IN_PROGRESS","qrStartToken":"{QR_TOKEN}","autoStartToken":"{AUTO_START_TOKEN}"}}"#
                ),
            )),
            PageEffect::Navigate(format!("{}/app/overview", bank.api_base)),
            PageEffect::Show(bank.logged_in_selectors[0].clone()),
        ],
    );
    browser
}
