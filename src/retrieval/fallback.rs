//! Reads accounts and transactions out of rendered bank pages.
//!
//! Strategies are tried in order and the first one that yields records wins:
//! tables with heading-based column inference, then styled list rows, then a
//! scan of page scripts for embedded JSON state.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;

use super::records::{
    account_from_record, finish_transactions, parse_bank_date, record_list,
    transaction_from_record, RawTransaction, ACCOUNT_COLLECTION_KEYS,
    TRANSACTION_COLLECTION_KEYS,
};
use crate::models::{parse_minor_units, Account, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStrategy {
    Table,
    List,
    EmbeddedJson,
}

impl ScrapeStrategy {
    pub const ORDER: [ScrapeStrategy; 3] = [
        ScrapeStrategy::Table,
        ScrapeStrategy::List,
        ScrapeStrategy::EmbeddedJson,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Date,
    Payee,
    Amount,
    Notes,
    Balance,
    AccountName,
    AccountNumber,
}

// Checked in order; a heading is assigned to the first column whose keyword it
// contains. Number comes before name so "Kontonummer" is not read as a name.
const HEADING_KEYWORDS: &[(Column, &[&str])] = &[
    (Column::AccountNumber, &["account number", "kontonummer", "nummer", "number", "konto nr", "kontonr"]),
    (Column::AccountName, &["account name", "kontonamn", "namn", "name"]),
    (Column::Date, &["date", "datum", "bokförd", "bokf", "booked", "transaktionsdag"]),
    (Column::Balance, &["balance", "saldo", "disponibelt"]),
    (Column::Amount, &["amount", "belopp", "summa"]),
    (Column::Notes, &["message", "meddelande", "notes", "reference", "referens"]),
    (Column::Payee, &["description", "beskrivning", "text", "specifikation", "mottagare", "payee", "merchant", "rubrik"]),
];

fn selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("invalid fallback selector"))
}

fn table_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "table")
}

fn row_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "tr")
}

fn transaction_item_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(
        &SEL,
        "[data-test-id='transaction-row'], li[class*='transaction'], div[class*='transaction-row']",
    )
}

fn account_item_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(
        &SEL,
        "[data-test-id='account-row'], li[class*='account'], div[class*='account-row']",
    )
}

fn date_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "[class*='date'], time")
}

fn payee_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(
        &SEL,
        "[class*='description'], [class*='payee'], [class*='merchant'], [class*='title'], [class*='name']",
    )
}

fn amount_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "[class*='amount']")
}

fn account_name_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "[class*='name'], [class*='title']")
}

fn account_number_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "[class*='number']")
}

fn script_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "script")
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("invalid whitespace regex"))
}

fn account_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d\s\-.,]{5,}\d").expect("invalid account number regex"))
}

fn element_text(el: ElementRef<'_>) -> String {
    ws_re()
        .replace_all(el.text().collect::<Vec<_>>().join(" ").trim(), " ")
        .trim()
        .to_string()
}

fn first_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .map(element_text)
        .find(|text| !text.is_empty())
}

/// Page-scrape fallback for one bank's markup conventions.
#[derive(Debug, Clone)]
pub struct PageScraper {
    marker: String,
}

impl PageScraper {
    pub fn new(preliminary_marker: impl Into<String>) -> Self {
        Self {
            marker: preliminary_marker.into(),
        }
    }

    pub fn accounts(&self, html: &str) -> Vec<Account> {
        let doc = Html::parse_document(html);
        for strategy in ScrapeStrategy::ORDER {
            let accounts = match strategy {
                ScrapeStrategy::Table => self.account_tables(&doc),
                ScrapeStrategy::List => self.account_list(&doc),
                ScrapeStrategy::EmbeddedJson => embedded_records(&doc, "accounts", ACCOUNT_COLLECTION_KEYS)
                    .iter()
                    .filter_map(account_from_record)
                    .collect(),
            };
            if !accounts.is_empty() {
                debug!(?strategy, count = accounts.len(), "Scraped accounts");
                return accounts;
            }
        }
        Vec::new()
    }

    pub fn transactions(
        &self,
        html: &str,
        account_number: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<Transaction> {
        let doc = Html::parse_document(html);
        for strategy in ScrapeStrategy::ORDER {
            let raw = match strategy {
                ScrapeStrategy::Table => self.transaction_tables(&doc),
                ScrapeStrategy::List => self.transaction_list(&doc),
                ScrapeStrategy::EmbeddedJson => {
                    embedded_records(&doc, "transactions", TRANSACTION_COLLECTION_KEYS)
                        .iter()
                        .filter_map(|record| transaction_from_record(record, &self.marker))
                        .collect()
                }
            };
            if !raw.is_empty() {
                debug!(?strategy, count = raw.len(), "Scraped transactions");
                return finish_transactions(raw, account_number, &self.marker, from, to);
            }
        }
        Vec::new()
    }

    fn transaction_tables(&self, doc: &Html) -> Vec<RawTransaction> {
        let mut out = Vec::new();
        for table in doc.select(table_sel()) {
            let rows = table_rows(table);
            let Some((heading_is_th, headings, body)) = split_heading(&rows) else {
                continue;
            };
            if let Some(layout) = TransactionLayout::from_headings(&headings) {
                out.extend(body.iter().filter_map(|row| layout.read(row)));
                continue;
            }

            // Without recognizable headings a plain first row is data too.
            let mut data = if heading_is_th { Vec::new() } else { vec![headings] };
            data.extend(body);
            if let Some(layout) = data.first().and_then(|row| TransactionLayout::sniff(row)) {
                out.extend(data.iter().filter_map(|row| layout.read(row)));
            }
        }
        out
    }

    fn transaction_list(&self, doc: &Html) -> Vec<RawTransaction> {
        doc.select(transaction_item_sel())
            .filter_map(|item| {
                let date = parse_bank_date(&first_text(item, date_sel())?)?;
                let amount = parse_minor_units(&first_text(item, amount_sel())?).ok()?;
                let payee = first_text(item, payee_sel())?;
                Some(RawTransaction {
                    date,
                    amount,
                    payee,
                    notes: String::new(),
                    sequence: item
                        .value()
                        .attr("data-sequence")
                        .or_else(|| item.value().attr("data-id"))
                        .map(str::to_string),
                })
            })
            .collect()
    }

    fn account_tables(&self, doc: &Html) -> Vec<Account> {
        let mut out = Vec::new();
        for table in doc.select(table_sel()) {
            let rows = table_rows(table);
            let Some((_, headings, body)) = split_heading(&rows) else {
                continue;
            };
            let columns: Vec<Option<Column>> = headings.iter().map(|h| classify_heading(h)).collect();
            let Some(number_idx) = columns.iter().position(|c| *c == Some(Column::AccountNumber)) else {
                continue;
            };
            let name_idx = columns.iter().position(|c| *c == Some(Column::AccountName));

            for row in body {
                let Some(number) = row.get(number_idx).map(|s| s.trim()).filter(|s| !s.is_empty()) else {
                    continue;
                };
                let name = name_idx
                    .and_then(|i| row.get(i))
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(number);
                out.push(Account::new(number, name));
            }
        }
        out
    }

    fn account_list(&self, doc: &Html) -> Vec<Account> {
        doc.select(account_item_sel())
            .filter_map(|item| {
                let number = first_text(item, account_number_sel())
                    .or_else(|| {
                        account_number_re()
                            .find(&element_text(item))
                            .map(|m| m.as_str().to_string())
                    })?;
                let name = first_text(item, account_name_sel()).unwrap_or_else(|| number.clone());
                Some(Account::new(number, name))
            })
            .collect()
    }
}

fn table_rows(table: ElementRef<'_>) -> Vec<(bool, Vec<String>)> {
    table
        .select(row_sel())
        .map(|tr| {
            let mut is_heading = false;
            let cells = tr
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|cell| {
                    let name = cell.value().name();
                    if name.eq_ignore_ascii_case("th") {
                        is_heading = true;
                    }
                    name.eq_ignore_ascii_case("td") || name.eq_ignore_ascii_case("th")
                })
                .map(element_text)
                .collect::<Vec<_>>();
            (is_heading, cells)
        })
        .filter(|(_, cells)| cells.iter().any(|c| !c.is_empty()))
        .collect()
}

/// Heading row (first row with `<th>` cells, or simply the first row) and
/// the data rows below it. The flag tells which of the two it was.
fn split_heading(rows: &[(bool, Vec<String>)]) -> Option<(bool, Vec<String>, Vec<Vec<String>>)> {
    let heading_idx = rows.iter().position(|(is_heading, _)| *is_heading).unwrap_or(0);
    let (is_th, heading) = rows.get(heading_idx)?;
    let body: Vec<Vec<String>> = rows[heading_idx + 1..]
        .iter()
        .filter(|(is_heading, _)| !is_heading)
        .map(|(_, cells)| cells.clone())
        .collect();
    if body.is_empty() {
        return None;
    }
    Some((*is_th, heading.clone(), body))
}

fn classify_heading(heading: &str) -> Option<Column> {
    let heading = heading.to_lowercase();
    HEADING_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| heading.contains(k)))
        .map(|(column, _)| *column)
}

/// Column positions for a transaction table.
#[derive(Debug, Clone, Copy)]
struct TransactionLayout {
    date: usize,
    payee: usize,
    amount: usize,
    notes: Option<usize>,
}

impl TransactionLayout {
    fn from_headings(headings: &[String]) -> Option<Self> {
        let mut date = None;
        let mut payee = None;
        let mut amount = None;
        let mut notes = None;
        for (idx, heading) in headings.iter().enumerate() {
            let slot = match classify_heading(heading) {
                Some(Column::Date) => &mut date,
                Some(Column::Payee) => &mut payee,
                Some(Column::Amount) => &mut amount,
                Some(Column::Notes) => &mut notes,
                _ => continue,
            };
            // The first matching heading wins (booking date over value date).
            slot.get_or_insert(idx);
        }
        Some(Self {
            date: date?,
            payee: payee?,
            amount: amount?,
            notes,
        })
    }

    /// Guess columns from one data row: first date-like cell, first cell
    /// after it that is not a number, first amount-like cell after that.
    fn sniff(row: &[String]) -> Option<Self> {
        let date = row.iter().position(|c| parse_bank_date(c).is_some())?;
        let payee = row
            .iter()
            .enumerate()
            .skip(date + 1)
            .find(|(_, c)| !c.is_empty() && parse_minor_units(c).is_err())
            .map(|(i, _)| i)?;
        let amount = row
            .iter()
            .enumerate()
            .skip(payee + 1)
            .find(|(_, c)| parse_minor_units(c).is_ok())
            .map(|(i, _)| i)?;
        Some(Self {
            date,
            payee,
            amount,
            notes: None,
        })
    }

    fn read(&self, row: &[String]) -> Option<RawTransaction> {
        let date = parse_bank_date(row.get(self.date)?)?;
        let amount = parse_minor_units(row.get(self.amount)?).ok()?;
        let payee = row.get(self.payee)?.trim();
        if payee.is_empty() {
            return None;
        }
        Some(RawTransaction {
            date,
            amount,
            payee: payee.to_string(),
            notes: self
                .notes
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default(),
            sequence: None,
        })
    }
}

/// Record lists found in page scripts.
///
/// Whole-script JSON (`<script type="application/json">`) is parsed directly;
/// otherwise every `"<key>":` occurrence is followed by a balanced scan of the
/// array or object after it.
fn embedded_records(doc: &Html, key: &str, collection_keys: &[&str]) -> Vec<Value> {
    let needle = format!("\"{key}\"");
    let mut out = Vec::new();
    for script in doc.select(script_sel()) {
        let text = script.text().collect::<String>();
        if !text.contains(&needle) {
            continue;
        }

        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            if let Some(records) = find_records(&value, key, collection_keys) {
                out.extend(records);
                continue;
            }
        }

        let mut search_from = 0;
        while let Some(pos) = text[search_from..].find(&needle) {
            let after_key = search_from + pos + needle.len();
            search_from = after_key;
            let rest = text[after_key..].trim_start();
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            let rest = rest.trim_start();
            let Some(slice) = balanced_json(rest) else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<Value>(slice) {
                if let Some(records) = record_list(&value, collection_keys) {
                    out.extend(records);
                }
            }
        }
    }
    out
}

/// Depth-first search for `key` holding a record list.
fn find_records(value: &Value, key: &str, collection_keys: &[&str]) -> Option<Vec<Value>> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(|v| record_list(v, collection_keys)) {
                return Some(found);
            }
            map.values().find_map(|v| find_records(v, key, collection_keys))
        }
        Value::Array(items) => items.iter().find_map(|v| find_records(v, key, collection_keys)),
        _ => None,
    }
}

/// The JSON array or object at the start of `text`, up to its matching
/// closing bracket. String literals and escapes are skipped.
fn balanced_json(text: &str) -> Option<&str> {
    let open = text.chars().next()?;
    if open != '[' && open != '{' {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}
