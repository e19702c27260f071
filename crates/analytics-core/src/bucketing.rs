//! Canonical UTC time buckets for every granularity.
//!
//! Buckets are half-open `[start, end)` intervals. For a given granularity
//! they never overlap and tile the whole timeline, so every instant belongs to
//! exactly one bucket.

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Timelike, Utc, Weekday};
use serde::Serialize;

use crate::models::Granularity;

// ── TimeBucket ────────────────────────────────────────────────────────────────

/// One bucket of a granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TimeBucket {
    pub granularity: Granularity,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end; equals the start of the next bucket.
    pub end: DateTime<Utc>,
}

impl TimeBucket {
    /// `true` when the bucket lies entirely inside `[start, end)`.
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start <= self.start && self.end <= end
    }

    /// The adjacent following bucket.
    pub fn next(&self) -> TimeBucket {
        TimeBucket {
            granularity: self.granularity,
            start: self.end,
            end: advance(self.end, self.granularity),
        }
    }

    /// Human-readable label for charts and API output.
    ///
    /// Weeks use the ISO week of the bucket's fourth day, which is the ISO
    /// week holding most of the bucket whatever weekday it starts on.
    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Hour => self.start.format("%Y-%m-%dT%H:00").to_string(),
            Granularity::Day => self.start.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let iso = (self.start + Duration::days(3)).iso_week();
                format!("{}-W{:02}", iso.year(), iso.week())
            }
            Granularity::Month => self.start.format("%Y-%m").to_string(),
            Granularity::Year => self.start.format("%Y").to_string(),
        }
    }
}

// ── Bucketing ─────────────────────────────────────────────────────────────────

/// Map `ts` to its bucket at `granularity`.
///
/// Weekly buckets start at 00:00 UTC on the most recent `week_start` weekday
/// at or before `ts`.
pub fn bucket_for(ts: DateTime<Utc>, granularity: Granularity, week_start: Weekday) -> TimeBucket {
    let start = truncate(ts, granularity, week_start);
    TimeBucket {
        granularity,
        start,
        end: advance(start, granularity),
    }
}

/// Every bucket of `granularity` that intersects `[start, end)`, ascending.
///
/// Yields nothing when `end <= start`.
pub fn buckets_between(
    granularity: Granularity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    week_start: Weekday,
) -> impl Iterator<Item = TimeBucket> {
    let first = (start < end).then(|| bucket_for(start, granularity, week_start));
    std::iter::successors(first, |b| Some(b.next())).take_while(move |b| b.start < end)
}

/// The most recently completed bucket before the one containing `now`.
pub fn previous_completed(
    granularity: Granularity,
    now: DateTime<Utc>,
    week_start: Weekday,
) -> TimeBucket {
    let current = bucket_for(now, granularity, week_start);
    bucket_for(
        current.start - Duration::nanoseconds(1),
        granularity,
        week_start,
    )
}

fn truncate(ts: DateTime<Utc>, granularity: Granularity, week_start: Weekday) -> DateTime<Utc> {
    let date = ts.date_naive();
    let day = match granularity {
        Granularity::Hour => {
            return date.and_time(NaiveTime::MIN).and_utc() + Duration::hours(i64::from(ts.hour()))
        }
        Granularity::Day => date,
        Granularity::Week => {
            let back = (7 + date.weekday().num_days_from_monday()
                - week_start.num_days_from_monday())
                % 7;
            date - Duration::days(i64::from(back))
        }
        Granularity::Month => date - Duration::days(i64::from(date.day0())),
        Granularity::Year => date - Duration::days(i64::from(date.ordinal0())),
    };
    day.and_time(NaiveTime::MIN).and_utc()
}

fn advance(start: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    let next = match granularity {
        Granularity::Hour => start.checked_add_signed(Duration::hours(1)),
        Granularity::Day => start.checked_add_signed(Duration::days(1)),
        Granularity::Week => start.checked_add_signed(Duration::weeks(1)),
        Granularity::Month => start.checked_add_months(Months::new(1)),
        Granularity::Year => start.checked_add_months(Months::new(12)),
    };
    next.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
