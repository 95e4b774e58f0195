use serde::{Deserialize, Serialize};

/// A bank account as listed by the bank. Identity is `account_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_number: String,
    pub display_name: String,
    pub official_name: String,
    #[serde(default)]
    pub ledger_system_code: String,
    #[serde(default)]
    pub ledger_status_code: String,
    #[serde(default)]
    pub holder_name: String,
}

impl Account {
    pub fn new(account_number: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            account_number: account_number.into(),
            official_name: display_name.clone(),
            display_name,
            ledger_system_code: String::new(),
            ledger_status_code: String::new(),
            holder_name: String::new(),
        }
    }

    pub fn with_official_name(mut self, name: impl Into<String>) -> Self {
        self.official_name = name.into();
        self
    }

    /// Matches by display name or official name (case-insensitive), or by the
    /// literal account number.
    pub fn matches(&self, criteria: &str) -> bool {
        let criteria = criteria.trim();
        if criteria.is_empty() {
            return false;
        }
        self.account_number == criteria
            || eq_ignore_case(&self.display_name, criteria)
            || eq_ignore_case(&self.official_name, criteria)
    }

    /// Short human-readable label used when listing alternatives.
    pub fn label(&self) -> String {
        if self.display_name.is_empty() || self.display_name == self.account_number {
            self.account_number.clone()
        } else {
            format!("{} ({})", self.display_name, self.account_number)
        }
    }
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    !a.is_empty() && a.trim().to_lowercase() == b.to_lowercase()
}
