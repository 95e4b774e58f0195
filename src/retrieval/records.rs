//! Loose conversion of bank JSON records into [`Account`] and [`Transaction`].
//!
//! The bank has renamed fields between API versions and the embedded page
//! state uses yet another spelling, so records are read by trying a list of
//! known keys instead of through one fixed wire struct.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{
    is_preliminary_payee, json_minor_units, Account, ImportedIdBuilder, Transaction,
};

const ACCOUNT_NUMBER_KEYS: &[&str] = &[
    "accountNumber",
    "number",
    "accountNo",
    "bban",
    "iban",
    "accountId",
    "id",
];
const DISPLAY_NAME_KEYS: &[&str] = &["displayName", "name", "alias", "nickname", "accountName"];
const OFFICIAL_NAME_KEYS: &[&str] = &["officialName", "productName", "accountType", "type"];
const SYSTEM_CODE_KEYS: &[&str] = &["ledgerSystemCode", "systemCode", "productCode"];
const STATUS_CODE_KEYS: &[&str] = &["ledgerStatusCode", "statusCode", "accountStatus"];
const HOLDER_KEYS: &[&str] = &["holderName", "owner", "ownerName", "holder"];

const DATE_KEYS: &[&str] = &[
    "date",
    "bookingDate",
    "transactionDate",
    "accountingDate",
    "valueDate",
];
const AMOUNT_KEYS: &[&str] = &["amount", "transactionAmount", "value", "sum"];
const PAYEE_KEYS: &[&str] = &[
    "payeeName",
    "description",
    "descriptiveText",
    "text",
    "merchant",
    "counterpartyName",
    "title",
    "name",
];
const NOTES_KEYS: &[&str] = &["notes", "message", "reference", "note"];
const SEQUENCE_KEYS: &[&str] = &[
    "sequenceNumber",
    "serialNumber",
    "transactionId",
    "archiveId",
    "id",
];
const STATUS_KEYS: &[&str] = &["status", "bookingStatus", "transactionStatus"];

/// Collection keys that may wrap a record list.
pub(crate) const ACCOUNT_COLLECTION_KEYS: &[&str] = &["accounts", "items", "data", "result"];
pub(crate) const TRANSACTION_COLLECTION_KEYS: &[&str] =
    &["transactions", "items", "data", "result", "bookedTransactions"];

/// A transaction read from the bank before its imported id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawTransaction {
    pub date: NaiveDate,
    pub amount: i64,
    pub payee: String,
    pub notes: String,
    pub sequence: Option<String>,
}

impl RawTransaction {
    pub fn into_transaction(self, ids: &mut ImportedIdBuilder, marker: &str) -> Transaction {
        let imported_id = ids.build(
            self.date,
            self.sequence.as_deref(),
            self.amount,
            &self.payee,
            marker,
        );
        Transaction::new(self.date, self.amount, self.payee, imported_id).with_notes(self.notes)
    }
}

/// Assign ids in bank order, then keep what falls inside `[from, to]`.
pub(crate) fn finish_transactions(
    raw: Vec<RawTransaction>,
    account_number: &str,
    marker: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<Transaction> {
    let mut ids = ImportedIdBuilder::new(account_number);
    raw.into_iter()
        .map(|r| r.into_transaction(&mut ids, marker))
        .filter(|t| t.date >= from && t.date <= to)
        .collect()
}

/// Records found in `body`: a bare array, or an array under one of `keys`,
/// looked up one level deep as well (`{"data": {"transactions": [...]}}`).
pub(crate) fn record_list(body: &Value, keys: &[&str]) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => {
            for key in keys {
                match map.get(*key) {
                    Some(Value::Array(items)) => return Some(items.clone()),
                    Some(nested @ Value::Object(_)) => {
                        if let Some(items) = record_list(nested, keys) {
                            return Some(items);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => None,
    }
}

pub(crate) fn account_from_record(record: &Value) -> Option<Account> {
    let map = record.as_object()?;
    let number = text(map, ACCOUNT_NUMBER_KEYS)?;
    let display = text(map, DISPLAY_NAME_KEYS).unwrap_or_else(|| number.clone());
    let official = text(map, OFFICIAL_NAME_KEYS).unwrap_or_else(|| display.clone());

    let mut account = Account::new(number, display).with_official_name(official);
    account.ledger_system_code = text(map, SYSTEM_CODE_KEYS).unwrap_or_default();
    account.ledger_status_code = text(map, STATUS_CODE_KEYS).unwrap_or_default();
    account.holder_name = text(map, HOLDER_KEYS).unwrap_or_default();
    Some(account)
}

/// `None` for records without a usable date, amount or payee.
pub(crate) fn transaction_from_record(record: &Value, marker: &str) -> Option<RawTransaction> {
    let map = record.as_object()?;
    let date = DATE_KEYS
        .iter()
        .filter_map(|key| map.get(*key)?.as_str())
        .find_map(parse_bank_date)?;
    let amount = amount(map)?;
    let mut payee = text(map, PAYEE_KEYS)?;

    let pending = text(map, STATUS_KEYS)
        .map(|s| is_pending_status(&s))
        .unwrap_or(false);
    if pending && !is_preliminary_payee(&payee, marker) {
        payee = format!("{marker} {payee}");
    }

    Some(RawTransaction {
        date,
        amount,
        payee,
        notes: text(map, NOTES_KEYS).unwrap_or_default(),
        sequence: text(map, SEQUENCE_KEYS),
    })
}

fn is_pending_status(status: &str) -> bool {
    matches!(
        status.trim().to_lowercase().as_str(),
        "pending" | "preliminary" | "reserved" | "prel" | "preliminär" | "reserverad"
    )
}

fn amount(map: &Map<String, Value>) -> Option<i64> {
    for key in AMOUNT_KEYS {
        let value = match map.get(*key) {
            // {"amount": {"amount": "-12.50", "currency": "SEK"}}
            Some(Value::Object(inner)) => inner.get("amount").or_else(|| inner.get("value")),
            other => other,
        };
        if let Some(minor) = value.and_then(|v| json_minor_units(v).ok()) {
            return Some(minor);
        }
    }
    None
}

/// First non-empty string (or number rendered as a string) under `keys`.
fn text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn iso_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})(?:[T ]|$)").expect("invalid iso date regex"))
}

/// Parse the date formats the bank uses in JSON and in rendered pages.
pub fn parse_bank_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(caps) = iso_prefix_re().captures(raw) {
        return NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok();
    }
    ["%Y%m%d", "%Y/%m/%d", "%d.%m.%Y", "%d/%m/%Y", "%y-%m-%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn dates_in_bank_formats() {
        assert_eq!(parse_bank_date("2024-03-01"), Some(ymd(2024, 3, 1)));
        assert_eq!(parse_bank_date("2024-03-01T00:00:00+01:00"), Some(ymd(2024, 3, 1)));
        assert_eq!(parse_bank_date("20240301"), Some(ymd(2024, 3, 1)));
        assert_eq!(parse_bank_date("01.03.2024"), Some(ymd(2024, 3, 1)));
        assert_eq!(parse_bank_date("24-03-01"), Some(ymd(2024, 3, 1)));
        assert_eq!(parse_bank_date("yesterday"), None);
    }

    #[test]
    fn record_list_accepts_bare_and_wrapped_arrays() {
        assert_eq!(record_list(&json!([1, 2]), &["accounts"]).map(|v| v.len()), Some(2));
        assert_eq!(
            record_list(&json!({"data": {"accounts": [1]}}), ACCOUNT_COLLECTION_KEYS)
                .map(|v| v.len()),
            Some(1)
        );
        assert_eq!(record_list(&json!({"other": []}), &["accounts"]), None);
    }

    #[test]
    fn account_fields_fall_back_to_each_other() {
        let account = account_from_record(&json!({
            "accountNumber": 12345678,
            "name": "Everyday",
            "productName": "Privatkonto",
            "owner": "A. Person"
        }))
        .unwrap();
        assert_eq!(account.account_number, "12345678");
        assert_eq!(account.display_name, "Everyday");
        assert_eq!(account.official_name, "Privatkonto");
        assert_eq!(account.holder_name, "A. Person");

        let bare = account_from_record(&json!({"id": "9"})).unwrap();
        assert_eq!(bare.display_name, "9");
        assert!(account_from_record(&json!({"name": "no number"})).is_none());
    }

    #[test]
    fn pending_status_gets_the_marker() {
        let raw = transaction_from_record(
            &json!({
                "bookingDate": "2024-03-01",
                "amount": {"amount": "-49.90", "currency": "SEK"},
                "description": "ICA Kvantum",
                "status": "PENDING"
            }),
            "Prel",
        )
        .unwrap();
        assert_eq!(raw.payee, "Prel ICA Kvantum");
        assert_eq!(raw.amount, -4990);

        let already = transaction_from_record(
            &json!({"date": "2024-03-01", "amount": -1, "text": "Prel ICA", "status": "pending"}),
            "Prel",
        )
        .unwrap();
        assert_eq!(already.payee, "Prel ICA");
    }

    #[test]
    fn incomplete_transactions_are_skipped() {
        assert!(transaction_from_record(&json!({"amount": 1, "text": "x"}), "Prel").is_none());
        assert!(transaction_from_record(&json!({"date": "2024-01-01", "text": "x"}), "Prel").is_none());
        assert!(
            transaction_from_record(&json!({"date": "2024-01-01", "amount": "abc", "text": "x"}), "Prel")
                .is_none()
        );
    }

    #[test]
    fn finish_filters_after_assigning_ids() {
        let raw = vec![
            RawTransaction {
                date: ymd(2024, 2, 28),
                amount: -100,
                payee: "Coffee".to_string(),
                notes: String::new(),
                sequence: None,
            },
            RawTransaction {
                date: ymd(2024, 3, 2),
                amount: -100,
                payee: "Coffee".to_string(),
                notes: String::new(),
                sequence: Some("77".to_string()),
            },
        ];
        let txs = finish_transactions(raw, "1234", "Prel", ymd(2024, 3, 1), ymd(2024, 3, 31));
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].imported_id, "1234:2024-03-02:77");
    }
}
