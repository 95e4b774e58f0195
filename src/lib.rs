//! BankID-authenticated transaction fetching.
//!
//! [`BankClient`] drives a browser through the bank's BankID login, reads
//! the selected account's transactions from the bank's JSON endpoints (or the
//! rendered pages when those fail), and reconciles them against an existing
//! ledger with [`dedup::Deduplicator`].

pub mod auth;
pub mod browser;
pub mod client;
pub mod config;
pub mod dedup;
pub mod duration;
pub mod error;
pub mod models;
pub mod retrieval;

pub use client::{BankClient, ClientState};
pub use error::{BankError, Result};
