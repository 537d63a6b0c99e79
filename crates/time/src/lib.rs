//! Resolves a small, deliberately unambitious grammar of time strings into a
//! UTC instant. No locale/natural-language support beyond what's documented
//! here — "tomorrow at 9am"-style inputs fail cleanly rather than guessing.

use chrono::{DateTime, NaiveDateTime, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported time string {input:?}: expected \"now\", \"in <N> minutes|hours|days\", or an ISO-8601 timestamp")]
pub struct TimeResolveError {
    pub input: String,
}

fn err(input: &str) -> TimeResolveError {
    TimeResolveError {
        input: input.to_string(),
    }
}

/// Resolve `s` (case-insensitive after trimming) relative to `now`.
pub fn resolve(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeResolveError> {
    let trimmed = s.trim();
    let lower = trimmed.to_lowercase();

    if lower == "now" {
        return Ok(now);
    }

    if let Some(rest) = lower.strip_prefix("in ") {
        return resolve_relative(trimmed, rest, now);
    }

    if lower.contains('t') || lower.ends_with('z') {
        return resolve_iso8601(trimmed);
    }

    Err(err(trimmed))
}

fn resolve_relative(
    original: &str,
    rest: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, TimeResolveError> {
    let mut parts = rest.split_whitespace();
    let count_str = parts.next().ok_or_else(|| err(original))?;
    let unit_str = parts.next().ok_or_else(|| err(original))?;
    if parts.next().is_some() {
        return Err(err(original));
    }

    let count: i64 = count_str.parse().map_err(|_| err(original))?;
    if count < 0 {
        return Err(err(original));
    }

    let duration = match unit_str {
        "minute" | "minutes" => chrono::Duration::minutes(count),
        "hour" | "hours" => chrono::Duration::hours(count),
        "day" | "days" => chrono::Duration::days(count),
        _ => return Err(err(original)),
    };

    Ok(now + duration)
}

fn resolve_iso8601(s: &str) -> Result<DateTime<Utc>, TimeResolveError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }

    Err(err(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn resolves_now_case_insensitively() {
        assert_eq!(resolve("now", now()).unwrap(), now());
        assert_eq!(resolve("  NOW ", now()).unwrap(), now());
    }

    #[test]
    fn resolves_in_minutes_within_tolerance() {
        let real_now = Utc::now();
        let resolved = resolve("in 5 minutes", real_now).unwrap();
        let delta = (resolved - (real_now + chrono::Duration::minutes(5)))
            .num_milliseconds()
            .abs();
        assert!(delta < 2000, "delta was {delta}ms");
    }

    #[test]
    fn resolves_in_hours_and_days() {
        assert_eq!(
            resolve("in 2 hours", now()).unwrap(),
            now() + chrono::Duration::hours(2)
        );
        assert_eq!(
            resolve("in 1 day", now()).unwrap(),
            now() + chrono::Duration::days(1)
        );
        assert_eq!(
            resolve("IN 3 DAYS", now()).unwrap(),
            now() + chrono::Duration::days(3)
        );
    }

    #[test]
    fn rejects_negative_or_non_integer_counts() {
        assert!(resolve("in -5 minutes", now()).is_err());
        assert!(resolve("in five minutes", now()).is_err());
        assert!(resolve("in 5.5 minutes", now()).is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(resolve("in 5 fortnights", now()).is_err());
    }

    #[test]
    fn resolves_iso8601_with_trailing_z() {
        let resolved = resolve("2024-06-15T09:00:00Z", now()).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn resolves_iso8601_with_offset() {
        let resolved = resolve("2024-06-15T14:30:00+05:30", now()).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn resolves_naive_iso8601_as_utc() {
        let resolved = resolve("2024-06-15T09:00:00", now()).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn rejects_natural_language() {
        assert!(resolve("tomorrow at 9am", now()).is_err());
        assert!(resolve("next tuesday", now()).is_err());
        assert!(resolve("whenever", now()).is_err());
    }

    #[test]
    fn error_message_lists_supported_forms() {
        let e = resolve("nonsense", now()).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("now"));
        assert!(msg.contains("ISO-8601"));
    }
}
