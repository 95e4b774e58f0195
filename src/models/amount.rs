use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount {0:?}")]
    Invalid(String),
    #[error("Amount {0:?} does not fit in minor units")]
    OutOfRange(String),
}

/// Convert a bank amount string to signed minor units.
///
/// Accepts both `1422.30` and the localized `1 422,30 kr` forms the bank
/// renders in its pages. Values are multiplied by 100 and rounded half away
/// from zero.
pub fn parse_minor_units(raw: &str) -> Result<i64, AmountError> {
    let normalized = normalize(raw).ok_or_else(|| AmountError::Invalid(raw.to_string()))?;
    let value =
        Decimal::from_str(&normalized).map_err(|_| AmountError::Invalid(raw.to_string()))?;
    decimal_to_minor_units(value).ok_or_else(|| AmountError::OutOfRange(raw.to_string()))
}

/// Convert a JSON amount (string or number) to minor units.
pub fn json_minor_units(value: &serde_json::Value) -> Result<i64, AmountError> {
    match value {
        serde_json::Value::String(s) => parse_minor_units(s),
        // Display of f64 is the shortest round-trip form, so 1422.3 stays 1422.3
        // instead of picking up binary noise.
        serde_json::Value::Number(n) => parse_minor_units(&n.to_string()),
        other => Err(AmountError::Invalid(other.to_string())),
    }
}

fn decimal_to_minor_units(value: Decimal) -> Option<i64> {
    value
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

fn normalize(raw: &str) -> Option<String> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .collect();

    for suffix in ["SEK", "sek", "kr", "Kr", ":-"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.to_string();
        }
    }
    if s.starts_with('+') {
        s.remove(0);
    }
    if s.is_empty() {
        return None;
    }

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');
    let s = match (last_dot, last_comma) {
        // Whichever separator comes last is the decimal point.
        (Some(dot), Some(comma)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (None, Some(_)) => s.replace(',', "."),
        _ => s,
    };
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_plain_decimal_strings() {
        assert_eq!(parse_minor_units("1422.30"), Ok(142230));
        assert_eq!(parse_minor_units("-5.5"), Ok(-550));
        assert_eq!(parse_minor_units("0"), Ok(0));
        assert_eq!(parse_minor_units("12"), Ok(1200));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(parse_minor_units("0.005"), Ok(1));
        assert_eq!(parse_minor_units("-0.005"), Ok(-1));
        assert_eq!(parse_minor_units("2.344"), Ok(234));
        assert_eq!(parse_minor_units("2.345"), Ok(235));
    }

    #[test]
    fn accepts_localized_amounts() {
        assert_eq!(parse_minor_units("1 422,30"), Ok(142230));
        assert_eq!(parse_minor_units("\u{2212}1\u{a0}422,30 kr"), Ok(-142230));
        assert_eq!(parse_minor_units("1.422,30"), Ok(142230));
        assert_eq!(parse_minor_units("1,422.30"), Ok(142230));
        assert_eq!(parse_minor_units("+15,00 SEK"), Ok(1500));
    }

    #[test]
    fn json_numbers_and_strings_agree() {
        assert_eq!(json_minor_units(&serde_json::json!(1422.3)), Ok(142230));
        assert_eq!(json_minor_units(&serde_json::json!("1422.30")), Ok(142230));
        assert_eq!(json_minor_units(&serde_json::json!(-50)), Ok(-5000));
        assert!(json_minor_units(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_minor_units("abc"), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_minor_units("   "), Err(AmountError::Invalid(_))));
        assert!(matches!(
            parse_minor_units("999999999999999999999"),
            Err(AmountError::OutOfRange(_))
        ));
    }
}
