//! Human-readable durations for config values like "120s", "2m", "14d" or "500ms".

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

/// Parse a duration string.
///
/// Supported units are `ms`, `s`, `m`, `h` and `d`. Input is case-insensitive and
/// surrounding whitespace is ignored.
///
/// ```
/// use bankfetch::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("120s").unwrap(), Duration::from_secs(120));
/// assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with ms, s, m, h, or d")?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().context("Invalid number in duration")?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.checked_mul(60).context("Duration is too large")?),
        "h" => Duration::from_secs(num.checked_mul(60 * 60).context("Duration is too large")?),
        "d" => Duration::from_secs(
            num.checked_mul(24 * 60 * 60)
                .context("Duration is too large")?,
        ),
        _ => anyhow::bail!("Duration must end with ms, s, m, h, or d"),
    };
    Ok(duration)
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs >= 86400 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Use with `#[serde(serialize_with = "serialize_duration")]`.
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration(" 10M ").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("14d").unwrap(), Duration::from_secs(14 * 86400));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn format_round_trips() {
        for raw in ["500ms", "5s", "2m", "1h", "90s"] {
            let parsed = parse_duration(raw).unwrap();
            assert_eq!(format_duration(parsed), raw);
        }
    }
}
