use std::time::Duration;

use chrono::NaiveDate;

use crate::client::ClientState;

/// Failures surfaced by the bank client.
#[derive(Debug, thiserror::Error)]
pub enum BankError {
    /// A required login control was missing or could not be used.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timed out after {}s waiting for {what}", elapsed.as_secs())]
    Timeout {
        what: &'static str,
        elapsed: Duration,
    },

    /// Structured endpoints and the page fallback both came up empty.
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// A single transaction could not be judged against existing ones.
    #[error("Could not reconcile transaction {imported_id}: {reason}")]
    Reconciliation { imported_id: String, reason: String },

    /// The client was used out of order.
    #[error("Cannot {operation} while the client is {state}")]
    SessionState {
        operation: &'static str,
        state: ClientState,
    },

    #[error("No account matches {criteria:?}. Available accounts: {}", available.join(", "))]
    AccountNotFound {
        criteria: String,
        available: Vec<String>,
    },

    #[error("Invalid date range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Browser session error: {0:#}")]
    Browser(#[from] anyhow::Error),
}

impl BankError {
    /// Valid alternatives to show next to the reason, if any.
    pub fn alternatives(&self) -> &[String] {
        match self {
            BankError::AccountNotFound { available, .. } => available,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, BankError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_not_found_lists_alternatives() {
        let err = BankError::AccountNotFound {
            criteria: "Savings".to_string(),
            available: vec!["Everyday (1)".to_string(), "Card (2)".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "No account matches \"Savings\". Available accounts: Everyday (1), Card (2)"
        );
        assert_eq!(err.alternatives().len(), 2);
        assert!(BankError::Cancelled.alternatives().is_empty());
    }

    #[test]
    fn session_state_names_the_state() {
        let err = BankError::SessionState {
            operation: "fetch transactions",
            state: ClientState::Idle,
        };
        assert_eq!(err.to_string(), "Cannot fetch transactions while the client is idle");
    }
}
