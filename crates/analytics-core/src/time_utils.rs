use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use tracing::warn;

use crate::error::{AnalyticsError, Result};

// ── Timestamp parsing ─────────────────────────────────────────────────────────

/// Parse an ISO 8601 / RFC 3339 timestamp into UTC.
///
/// Naive datetimes without an offset are taken to be UTC. Returns `None` for
/// empty strings or unrecognised formats.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const FMTS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in FMTS {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    warn!("could not parse timestamp \"{}\"", s);
    None
}

/// Parse a plain `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| AnalyticsError::TimestampParse(s.to_string()))
}

/// Midnight UTC at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Midnight UTC after `date`; the exclusive end of an inclusive end date.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::days(1)
}

/// Parse either a date (midnight UTC) or a full timestamp.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        return Ok(start_of_day(date));
    }
    parse_timestamp(s).ok_or_else(|| AnalyticsError::TimestampParse(s.to_string()))
}

/// Parse a weekday name (`mon`, `Monday`, `sun`, ...).
pub fn parse_weekday(s: &str) -> std::result::Result<Weekday, String> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| format!("invalid weekday: {s}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
