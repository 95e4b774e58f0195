//! Reconciles freshly fetched transactions against what the ledger already has.
//!
//! Banks list unsettled purchases with a marker prefix on the payee and later
//! replace them with a settled entry that may differ slightly in text. The
//! rules here decide which fetched rows are new, which supersede a
//! preliminary entry, and which are duplicates.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BankError;
use crate::models::{is_preliminary_payee, strip_preliminary_marker, Transaction};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationOutcome {
    pub transactions_to_import: Vec<Transaction>,
    pub replaced_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<String>,
    /// Imported ids of the existing preliminary entries that were replaced.
    #[serde(default)]
    pub replaced_imported_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Import,
    Replace,
    Skip,
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    marker: String,
}

impl Deduplicator {
    pub fn new(preliminary_marker: impl Into<String>) -> Self {
        Self {
            marker: preliminary_marker.into(),
        }
    }

    fn is_preliminary(&self, tx: &Transaction) -> bool {
        is_preliminary_payee(&tx.payee_name, &self.marker)
    }

    /// Payees are similar when, with the marker stripped and case ignored, one
    /// contains the other. Banks truncate long merchant names.
    pub fn payees_similar(&self, a: &str, b: &str) -> bool {
        let a = strip_preliminary_marker(a, &self.marker).to_lowercase();
        let b = strip_preliminary_marker(b, &self.marker).to_lowercase();
        if a.is_empty() || b.is_empty() {
            return a == b;
        }
        a.contains(&b) || b.contains(&a)
    }

    /// Same date, amounts less than one minor unit apart, similar payees.
    pub fn matches(&self, fetched: &Transaction, existing: &Transaction) -> Result<bool, BankError> {
        if fetched.date != existing.date {
            return Ok(false);
        }
        let difference = fetched
            .amount
            .checked_sub(existing.amount)
            .ok_or_else(|| BankError::Reconciliation {
                imported_id: fetched.imported_id.clone(),
                reason: format!(
                    "amount difference between {} and {} overflows",
                    fetched.amount, existing.amount
                ),
            })?;
        Ok(difference.unsigned_abs() < 1 && self.payees_similar(&fetched.payee_name, &existing.payee_name))
    }

    fn decide<'e>(
        &self,
        fetched: &Transaction,
        existing: &'e [Transaction],
    ) -> Result<(Decision, Vec<&'e Transaction>), BankError> {
        let mut matched = Vec::new();
        for candidate in existing {
            if self.matches(fetched, candidate)? {
                matched.push(candidate);
            }
        }
        if matched.is_empty() {
            return Ok((Decision::Import, matched));
        }

        // A preliminary row never displaces anything. A settled row replaces
        // matching preliminary entries unless a settled twin already exists.
        let decision = if self.is_preliminary(fetched) || matched.iter().any(|m| !self.is_preliminary(m)) {
            Decision::Skip
        } else {
            Decision::Replace
        };
        Ok((decision, matched))
    }

    pub fn reconcile(&self, fetched: Vec<Transaction>, existing: &[Transaction]) -> DeduplicationOutcome {
        let mut outcome = DeduplicationOutcome::default();
        for tx in fetched {
            match self.decide(&tx, existing) {
                Ok((Decision::Import, _)) => outcome.transactions_to_import.push(tx),
                Ok((Decision::Replace, matched)) => {
                    debug!(imported_id = %tx.imported_id, replaced = matched.len(), "Settled transaction replaces preliminary");
                    outcome
                        .replaced_imported_ids
                        .extend(matched.iter().map(|m| m.imported_id.clone()));
                    outcome.replaced_count += 1;
                    outcome.transactions_to_import.push(tx);
                }
                Ok((Decision::Skip, _)) => outcome.skipped_count += 1,
                Err(e) => {
                    warn!(imported_id = %tx.imported_id, error = %e, "Could not reconcile transaction");
                    outcome.errors.push(e.to_string());
                }
            }
        }
        outcome
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(crate::models::DEFAULT_PRELIMINARY_MARKER)
    }
}
