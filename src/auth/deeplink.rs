//! Same-device BankID links built from an auto-start token.

use crate::config::DeeplinkConfig;

#[derive(Debug, Clone)]
pub struct DeepLinkBuilder {
    host: String,
    native_scheme: String,
}

impl DeepLinkBuilder {
    pub fn new(config: &DeeplinkConfig) -> Self {
        Self {
            host: config.host.trim_end_matches('/').to_string(),
            native_scheme: config.native_scheme.trim_end_matches("://").to_string(),
        }
    }

    /// Universal link, e.g. `https://app.bankid.com/?autostarttoken=..&redirect=null`.
    pub fn same_device_link(&self, auto_start_token: &str, redirect: Option<&str>) -> String {
        format!("https://{}/{}", self.host, query(auto_start_token, redirect))
    }

    /// Custom-scheme link opened directly by the installed app.
    pub fn native_link(&self, auto_start_token: &str, redirect: Option<&str>) -> String {
        format!("{}:///{}", self.native_scheme, query(auto_start_token, redirect))
    }
}

impl Default for DeepLinkBuilder {
    fn default() -> Self {
        Self::new(&DeeplinkConfig::default())
    }
}

fn query(auto_start_token: &str, redirect: Option<&str>) -> String {
    // The app expects the literal string "null" when it should not return anywhere.
    let redirect = match redirect {
        Some(url) if !url.is_empty() => urlencoding::encode(url).into_owned(),
        _ => "null".to_string(),
    };
    format!(
        "?autostarttoken={}&redirect={}",
        urlencoding::encode(auto_start_token),
        redirect
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_redirect_uses_literal_null() {
        let link = DeepLinkBuilder::default().same_device_link("abc-123", None);
        assert_eq!(link, "https://app.bankid.com/?autostarttoken=abc-123&redirect=null");
    }

    #[test]
    fn token_and_redirect_are_encoded() {
        let link = DeepLinkBuilder::default()
            .same_device_link("a b+c", Some("https://shop.example/return?x=1&y=2"));
        assert_eq!(
            link,
            "https://app.bankid.com/?autostarttoken=a%20b%2Bc&redirect=https%3A%2F%2Fshop.example%2Freturn%3Fx%3D1%26y%3D2"
        );
    }

    #[test]
    fn native_variant_shares_the_query() {
        let builder = DeepLinkBuilder::new(&DeeplinkConfig {
            host: "app.bankid.com/".to_string(),
            native_scheme: "bankid://".to_string(),
        });
        assert_eq!(
            builder.native_link("tok", Some("")),
            "bankid:///?autostarttoken=tok&redirect=null"
        );
    }
}
