//! Time parsers for CLI arguments.
//!
//! Supports:
//! - Retention windows: `90d`, `12w`, `36h`, `6mo`, `1y` (plain number = days)
//! - Intervals: `30s`, `10m`, `1h`, `1d` (plain number = seconds)
//! - Months: `2024-07` (or any date inside it, `2024-07-15`)
//! - Dates: `2024-07-15`, `today`, relative `-3d` / `+2w`

use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, TimeDelta, Utc};
use thiserror::Error;

/// Error type for time parsing failures.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to parse '{input}': {message}")]
pub struct TimeParseError {
    pub input: String,
    pub message: String,
}

impl TimeParseError {
    fn new(input: &str, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

/// Splits `90d` into `(90, "d")`.
fn split_number_unit(input: &str) -> Option<(i64, &str)> {
    let digits = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if digits == 0 {
        return None;
    }
    let number = input[..digits].parse().ok()?;
    Some((number, &input[digits..]))
}

/// Parses a retention window.
///
/// | Format | Example | Meaning |
/// |--------|---------|---------|
/// | Days | `90d`, `90` | 90 days |
/// | Weeks | `12w` | 84 days |
/// | Hours | `36h` | 36 hours |
/// | Months | `6mo` | 6 × 30 days |
/// | Years | `1y` | 365 days |
///
/// ```
/// use pgkeeper_core::util::parse_retention;
///
/// assert_eq!(parse_retention("90d").unwrap().num_days(), 90);
/// ```
pub fn parse_retention(input: &str) -> Result<TimeDelta, TimeParseError> {
    let input = input.trim();
    let (n, unit) = split_number_unit(input).ok_or_else(|| {
        TimeParseError::new(input, "Expected a number with unit: 90d, 12w, 36h, 6mo, 1y")
    })?;

    let delta = match unit {
        "" | "d" => TimeDelta::try_days(n),
        "w" => TimeDelta::try_weeks(n),
        "h" => TimeDelta::try_hours(n),
        "mo" => n.checked_mul(30).and_then(TimeDelta::try_days),
        "y" => n.checked_mul(365).and_then(TimeDelta::try_days),
        _ => {
            return Err(TimeParseError::new(
                input,
                format!("Unknown unit '{unit}'. Use d, w, h, mo or y"),
            ));
        }
    };
    delta.ok_or_else(|| TimeParseError::new(input, "Retention overflow"))
}

/// Parses a scheduling interval such as `10m`.
pub fn parse_interval(input: &str) -> Result<Duration, TimeParseError> {
    let input = input.trim();
    let (n, unit) = split_number_unit(input)
        .ok_or_else(|| TimeParseError::new(input, "Expected a number with unit: 30s, 10m, 1h"))?;

    let secs = match unit {
        "" | "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(86400),
        _ => {
            return Err(TimeParseError::new(
                input,
                format!("Unknown unit '{unit}'. Use s, m, h or d"),
            ));
        }
    };
    match secs {
        Some(0) => Err(TimeParseError::new(input, "Interval must be positive")),
        Some(s) => Ok(Duration::from_secs(s as u64)),
        None => Err(TimeParseError::new(input, "Interval overflow")),
    }
}

/// Parses `YYYY-MM` (or a full date) into the first day of that month.
pub fn parse_month(input: &str) -> Result<NaiveDate, TimeParseError> {
    let input = input.trim();
    let date = NaiveDate::parse_from_str(&format!("{input}-01"), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(input, "%Y-%m-%d"))
        .map_err(|_| TimeParseError::new(input, "Expected YYYY-MM"))?;
    date.with_day0(0)
        .ok_or_else(|| TimeParseError::new(input, "Invalid month"))
}

/// Parses a calendar date relative to today (UTC).
pub fn parse_date(input: &str) -> Result<NaiveDate, TimeParseError> {
    parse_date_with_base(input, Utc::now().date_naive())
}

/// Parses a calendar date, resolving `today` and relative forms against `base`.
pub fn parse_date_with_base(input: &str, base: NaiveDate) -> Result<NaiveDate, TimeParseError> {
    let input = input.trim();

    if input.eq_ignore_ascii_case("today") {
        return Ok(base);
    }

    if let Some(date) = try_parse_relative_date(input, base) {
        return Ok(date);
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|_| {
        TimeParseError::new(
            input,
            "Unrecognized format. Use: YYYY-MM-DD, today, or relative (-3d, +2w)",
        )
    })
}

/// Try to parse as relative date (-3d, +2w).
fn try_parse_relative_date(input: &str, base: NaiveDate) -> Option<NaiveDate> {
    let (sign, rest) = match input.as_bytes().first()? {
        b'-' => (-1, &input[1..]),
        b'+' => (1, &input[1..]),
        _ => return None,
    };
    let (n, unit) = split_number_unit(rest)?;
    let days = match unit {
        "d" => n,
        "w" => n.checked_mul(7)?,
        _ => return None,
    };
    let days = Days::new(u64::try_from(days).ok()?);
    if sign < 0 {
        base.checked_sub_days(days)
    } else {
        base.checked_add_days(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_retention_units() {
        assert_eq!(parse_retention("90d").unwrap(), TimeDelta::days(90));
        assert_eq!(parse_retention("90").unwrap(), TimeDelta::days(90));
        assert_eq!(parse_retention("12w").unwrap(), TimeDelta::days(84));
        assert_eq!(parse_retention("36h").unwrap(), TimeDelta::hours(36));
        assert_eq!(parse_retention("6mo").unwrap(), TimeDelta::days(180));
        assert_eq!(parse_retention("1y").unwrap(), TimeDelta::days(365));
    }

    #[test]
    fn test_retention_errors() {
        assert!(parse_retention("").is_err());
        assert!(parse_retention("d").is_err());
        let err = parse_retention("5x").unwrap_err();
        assert!(err.to_string().contains("Unknown unit 'x'"));
        assert!(parse_retention("99999999999999999y").is_err());
    }

    #[test]
    fn test_interval() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("1w").is_err());
    }

    #[test]
    fn test_month() {
        assert_eq!(parse_month("2024-07").unwrap(), d(2024, 7, 1));
        assert_eq!(parse_month("2024-07-19").unwrap(), d(2024, 7, 1));
        assert!(parse_month("2024-13").is_err());
        assert!(parse_month("July").is_err());
    }

    #[test]
    fn test_date() {
        let base = d(2024, 8, 15);
        assert_eq!(parse_date_with_base("2024-07-01", base).unwrap(), d(2024, 7, 1));
        assert_eq!(parse_date_with_base("today", base).unwrap(), base);
        assert_eq!(parse_date_with_base("-3d", base).unwrap(), d(2024, 8, 12));
        assert_eq!(parse_date_with_base("+2w", base).unwrap(), d(2024, 8, 29));
        assert!(parse_date_with_base("-3h", base).is_err());
        assert!(parse_date_with_base("yesterday", base).is_err());
    }
}
