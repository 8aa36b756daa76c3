//! # Validation
//!
//! Parsing of TTL durations and cron schedules.

use crate::observability;
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Invalid profile schedule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schedule '{expression}': {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

/// Invalid duration string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': {message}")]
pub struct DurationError {
    pub input: String,
    pub message: String,
}

static DURATION_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+[smhd])+$").expect("duration format regex is valid")
});

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+)(?P<unit>[smhd])").expect("duration part regex is valid")
});

/// Parse a Kubernetes-style duration into std::time::Duration
///
/// Accepts one or more `<number><unit>` parts with units s, m, h, d, e.g. "30s",
/// "5m", "1h30m", "2d". Zero is allowed.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let trimmed = duration_str.trim().to_lowercase();
    let error = |message: &str| DurationError {
        input: duration_str.to_string(),
        message: message.to_string(),
    };

    if trimmed.is_empty() {
        return Err(error("duration cannot be empty"));
    }
    if !DURATION_FORMAT.is_match(&trimmed) {
        return Err(error(
            "expected <number><unit>[<number><unit>...] with units s, m, h, d (e.g. '30m', '1h30m')",
        ));
    }

    let mut seconds: u64 = 0;
    for captures in DURATION_PART.captures_iter(&trimmed) {
        let number: u64 = captures["number"]
            .parse()
            .map_err(|_| error("number is too large"))?;
        let unit = match &captures["unit"] {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => 86400,
        };
        seconds = number
            .checked_mul(unit)
            .and_then(|part| seconds.checked_add(part))
            .ok_or_else(|| error("duration is too large"))?;
    }
    Ok(Duration::from_secs(seconds))
}

/// Parse a clone TTL. Absent or zero means the clone never expires.
pub fn parse_ttl(ttl: Option<&str>) -> Result<Option<Duration>, DurationError> {
    let Some(ttl) = ttl else {
        return Ok(None);
    };
    match parse_kubernetes_duration(ttl) {
        Ok(duration) if duration.is_zero() => Ok(None),
        Ok(duration) => Ok(Some(duration)),
        Err(e) => {
            observability::metrics::increment_duration_parsing_errors();
            Err(e)
        }
    }
}

/// Parse a cron expression
///
/// Five fields (minute hour day-of-month month day-of-week) get a leading `0` seconds
/// field; six and seven field expressions are passed through.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let error = |message: String| ScheduleError {
        expression: expression.to_string(),
        message,
    };
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => return Err(error(format!("expected 5 or 6 fields, got {n}"))),
    };
    cron::Schedule::from_str(&normalized).map_err(|e| error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Utc};

    #[test]
    fn test_parse_simple_durations() {
        assert_eq!(parse_kubernetes_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_kubernetes_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_kubernetes_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_kubernetes_duration("2d"), Ok(Duration::from_secs(172_800)));
        assert_eq!(parse_kubernetes_duration(" 1H "), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_compound_durations() {
        assert_eq!(
            parse_kubernetes_duration("1h30m"),
            Ok(Duration::from_secs(5400))
        );
        assert_eq!(
            parse_kubernetes_duration("1d2h3m4s"),
            Ok(Duration::from_secs(86400 + 7200 + 180 + 4))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_durations() {
        for input in ["", "1", "h", "1x", "1.5h", "-1h", "1h 30m", "99999999999999999999s"] {
            assert!(
                parse_kubernetes_duration(input).is_err(),
                "'{input}' should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        assert_eq!(parse_ttl(None), Ok(None));
        assert_eq!(parse_ttl(Some("0s")), Ok(None));
        assert_eq!(parse_ttl(Some("1h")), Ok(Some(Duration::from_secs(3600))));
        assert!(parse_ttl(Some("forever")).is_err());
    }

    #[test]
    fn test_five_field_schedule() {
        let schedule = parse_schedule("0 2 * * *").expect("valid schedule");
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .expect("valid time");
        let next: Vec<_> = schedule.after(&start).take(2).collect();
        assert_eq!(next[0], start + chrono::Duration::hours(14));
        assert_eq!(next[1] - next[0], chrono::Duration::days(1));
        assert_eq!(next[0].hour(), 2);
        assert_eq!(next[0].second(), 0);
    }

    #[test]
    fn test_six_field_schedule_has_seconds() {
        let schedule = parse_schedule("*/10 * * * * *").expect("valid schedule");
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid time");
        let next = schedule.after(&start).next().expect("upcoming time");
        assert_eq!(next - start, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("every day").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }
}
