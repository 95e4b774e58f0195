use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Payee prefix the bank uses for transactions that have not settled yet.
pub const DEFAULT_PRELIMINARY_MARKER: &str = "Prel";

/// A bank transaction ready for the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub date: NaiveDate,
    /// Signed amount in minor units; negative for debits.
    pub amount: i64,
    pub payee_name: String,
    #[serde(default)]
    pub notes: String,
    /// Composite key that stays the same when the same bank transaction is refetched.
    pub imported_id: String,
}

impl Transaction {
    pub fn new(
        date: NaiveDate,
        amount: i64,
        payee_name: impl Into<String>,
        imported_id: impl Into<String>,
    ) -> Self {
        Self {
            date,
            amount,
            payee_name: payee_name.into(),
            notes: String::new(),
            imported_id: imported_id.into(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Preliminary status using the default marker.
    pub fn is_preliminary(&self) -> bool {
        is_preliminary_payee(&self.payee_name, DEFAULT_PRELIMINARY_MARKER)
    }
}

/// True when `payee` starts with `marker` as a separate word (case-insensitive).
pub fn is_preliminary_payee(payee: &str, marker: &str) -> bool {
    strip_marker(payee, marker).is_some()
}

/// Payee name without the preliminary marker prefix, trimmed.
pub fn strip_preliminary_marker<'a>(payee: &'a str, marker: &str) -> &'a str {
    strip_marker(payee, marker).unwrap_or_else(|| payee.trim())
}

fn strip_marker<'a>(payee: &'a str, marker: &str) -> Option<&'a str> {
    let payee = payee.trim_start();
    if marker.is_empty() || payee.len() < marker.len() || !payee.is_char_boundary(marker.len()) {
        return None;
    }
    let (head, rest) = payee.split_at(marker.len());
    if !head.eq_ignore_ascii_case(marker) {
        return None;
    }
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_alphanumeric() => None,
        Some(_) => Some(rest.trim_start_matches(|c: char| !c.is_alphanumeric()).trim_end()),
    }
}

/// Builds composite imported ids for one account's fetch.
///
/// Bank-provided sequence numbers are preferred. Without one the id falls back
/// to date, amount and payee plus an occurrence counter so that two identical
/// purchases on the same day keep distinct ids across refetches.
#[derive(Debug)]
pub struct ImportedIdBuilder {
    account_number: String,
    seen: HashMap<String, usize>,
}

impl ImportedIdBuilder {
    pub fn new(account_number: impl Into<String>) -> Self {
        Self {
            account_number: account_number.into(),
            seen: HashMap::new(),
        }
    }

    pub fn build(
        &mut self,
        date: NaiveDate,
        sequence: Option<&str>,
        amount: i64,
        payee: &str,
        marker: &str,
    ) -> String {
        let base = match sequence.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sequence) => format!("{}:{}:{}", self.account_number, date, sequence),
            None => {
                // The marker is dropped so a preliminary row and its settled
                // counterpart do not differ only by prefix.
                let payee = strip_preliminary_marker(payee, marker).to_lowercase();
                format!("{}:{}:{}:{}", self.account_number, date, amount, payee)
            }
        };

        let count = self.seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{base}#{count}")
        }
    }
}
