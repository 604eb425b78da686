use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serializer};

/// Parse a human-readable duration such as `15s`, `250ms`, `5m` or `1m30s`.
///
/// A bare integer is taken as a number of seconds. An empty string is
/// rejected so callers can tell "unset" (a missing field) from garbage.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("empty duration");
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("invalid duration {:?}: missing unit", trimmed))?;
        if digits_end == 0 {
            bail!("invalid duration {:?}: expected a number", trimmed);
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|e| anyhow!("invalid duration {:?}: {}", trimmed, e))?;
        rest = &rest[digits_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let part = match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            other => bail!("invalid duration {:?}: unknown unit {:?}", trimmed, other),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| anyhow!("invalid duration {:?}: out of range", trimmed))?;
    }
    Ok(total)
}

/// Render a duration back into the format [`parse_duration`] accepts
pub fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// serde adapter for `Duration` fields written as `15s` or `15`
pub mod serde_duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_compound_and_bare() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 42 ").unwrap(), Duration::from_secs(42));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_rejects_overflow() {
        let err = parse_duration("9999999999999999h").unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(parse_duration("18446744073709551615s1s").is_err());
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        for d in [
            Duration::from_millis(1500),
            Duration::from_secs(15),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ] {
            assert_eq!(parse_duration(&format_duration(&d)).unwrap(), d);
        }
    }
}
