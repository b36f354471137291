//! Reset timestamp parsing and window bucketing.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::metric::{labels, FIVE_HOUR_MINUTES, MONTHLY_MINUTES, WEEKLY_MINUTES};

/// Epoch values below this are read as seconds, at or above as milliseconds.
const MILLIS_CUTOFF: f64 = 1e11;

/// Parses a reset value from a JSON document.
///
/// Accepts RFC 3339 strings, naive ISO-8601 strings (read as UTC), and
/// epoch numbers in seconds or milliseconds. Zero and empty values mean
/// "no reset".
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

/// Parses a reset timestamp from text.
pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(n) = s.parse::<f64>() {
        return from_epoch(n);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let millis = if n < MILLIS_CUTOFF { n * 1000.0 } else { n };
    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Window bucket implied by the time left until a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetBucket {
    FiveHour,
    Weekly,
    Monthly,
    Unbucketed,
}

impl ResetBucket {
    /// Buckets the distance from `now` to `reset`.
    ///
    /// Resets already in the past fall in the five-hour bucket.
    pub(crate) fn for_reset(reset: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let diff = reset - now;
        if diff <= Duration::hours(6) {
            ResetBucket::FiveHour
        } else if diff > Duration::hours(24) && diff <= Duration::days(8) {
            ResetBucket::Weekly
        } else if diff > Duration::days(8) && diff <= Duration::days(32) {
            ResetBucket::Monthly
        } else {
            ResetBucket::Unbucketed
        }
    }

    /// Label and window length for this bucket, if it overrides the key label.
    pub(crate) fn label(&self) -> Option<(&'static str, i64)> {
        match self {
            ResetBucket::FiveHour => Some((labels::FIVE_HOUR, FIVE_HOUR_MINUTES)),
            ResetBucket::Weekly => Some((labels::WEEKLY, WEEKLY_MINUTES)),
            ResetBucket::Monthly => Some((labels::MONTHLY, MONTHLY_MINUTES)),
            ResetBucket::Unbucketed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_rfc3339_and_naive() {
        let expected = at("2026-01-23T12:00:00Z");
        assert_eq!(parse_timestamp(&json!("2026-01-23T12:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2026-01-23T14:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2026-01-23T12:00:00.000")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2026-01-23 12:00:00")), Some(expected));
    }

    #[test]
    fn parses_epoch_seconds_and_millis() {
        let expected = at("2026-01-23T12:00:00Z");
        let secs = expected.timestamp();
        assert_eq!(parse_timestamp(&json!(secs)), Some(expected));
        assert_eq!(parse_timestamp(&json!(secs * 1000)), Some(expected));
        assert_eq!(parse_timestamp(&json!(secs.to_string())), Some(expected));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(parse_timestamp(&json!(0)), None);
        assert_eq!(parse_timestamp(&json!("")), None);
        assert_eq!(parse_timestamp(&json!("soon")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
        assert_eq!(parse_timestamp(&json!({"at": 1})), None);
    }

    #[test]
    fn bucket_boundaries() {
        let now = at("2026-01-23T12:00:00Z");
        let bucket = |d: Duration| ResetBucket::for_reset(now + d, now);

        assert_eq!(bucket(Duration::hours(6)), ResetBucket::FiveHour);
        assert_eq!(bucket(Duration::hours(6) + Duration::seconds(1)), ResetBucket::Unbucketed);
        assert_eq!(bucket(Duration::hours(24)), ResetBucket::Unbucketed);
        assert_eq!(bucket(Duration::hours(25)), ResetBucket::Weekly);
        assert_eq!(bucket(Duration::days(8)), ResetBucket::Weekly);
        assert_eq!(bucket(Duration::days(9)), ResetBucket::Monthly);
        assert_eq!(bucket(Duration::days(32)), ResetBucket::Monthly);
        assert_eq!(bucket(Duration::days(40)), ResetBucket::Unbucketed);
        assert_eq!(bucket(-Duration::hours(1)), ResetBucket::FiveHour);
    }
}
