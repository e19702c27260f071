use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};

// ── Granularity ───────────────────────────────────────────────────────────────

/// Time-bucket size used for an aggregate, ordered finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Every granularity in backfill order (finest first).
    pub const ALL: [Granularity; 5] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// The granularity whose buckets exactly tile one bucket of `self`.
    ///
    /// Weeks straddle month boundaries, so months roll up from days rather
    /// than weeks.
    pub fn finer(self) -> Option<Granularity> {
        match self {
            Granularity::Hour => None,
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Week | Granularity::Month => Some(Granularity::Day),
            Granularity::Year => Some(Granularity::Month),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            _ => Err(AnalyticsError::InvalidGranularity(s.to_string())),
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// What a raw event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A reader opened a blog post.
    View,
    /// An author published a blog post.
    Creation,
}

/// An immutable fact supplied by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// UTC instant the event happened.
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub blog_id: u64,
    pub author_id: u64,
    /// ISO 3166 alpha-2 code of the blog's country, when known.
    #[serde(default)]
    pub country: Option<String>,
    /// Viewer id for views by signed-in users.
    #[serde(default)]
    pub user_id: Option<u64>,
}

impl RawEvent {
    /// The fully qualified dimension tuple of this event.
    pub fn dimensions(&self) -> DimensionSet {
        DimensionSet {
            blog: Some(self.blog_id),
            country: self.country.as_deref().map(|c| c.to_ascii_uppercase()),
            author: Some(self.author_id),
        }
    }
}

/// The two families of aggregate the engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Views,
    Creations,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Views, MetricKind::Creations];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Views => "views",
            MetricKind::Creations => "creations",
        }
    }

    /// Raw event kind this metric counts.
    pub fn event_kind(self) -> EventKind {
        match self {
            MetricKind::Views => EventKind::View,
            MetricKind::Creations => EventKind::Creation,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "views" | "view" => Ok(MetricKind::Views),
            "creations" | "creation" | "blogs" => Ok(MetricKind::Creations),
            other => Err(AnalyticsError::Config(format!("unknown metric kind: {other}"))),
        }
    }
}

// ── Dimensions ────────────────────────────────────────────────────────────────

/// A grouping key aggregates can be narrowed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Blog,
    Country,
    Author,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Blog => "blog",
            Dimension::Country => "country",
            Dimension::Author => "author",
        }
    }
}

impl FromStr for Dimension {
    type Err = AnalyticsError;

    /// Accepts the bare names and the dotted field paths API clients send.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "blog" | "blog.id" => Ok(Dimension::Blog),
            "country" | "country.code" | "blog.country.code" => Ok(Dimension::Country),
            "author" | "author.id" | "blog.author.id" => Ok(Dimension::Author),
            _ => Err(AnalyticsError::UnknownDimension(s.to_string())),
        }
    }
}

fn country_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z]{2}$").expect("static regex"))
}

/// Validate and upper-case an alpha-2 country code.
pub fn normalize_country(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if country_code_pattern().is_match(trimmed) {
        Ok(trimmed.to_ascii_uppercase())
    } else {
        Err(AnalyticsError::InvalidDimensionValue {
            dimension: Dimension::Country.as_str().to_string(),
            value: code.to_string(),
        })
    }
}

/// A combination of dimension values. All fields `None` is the "all" set.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DimensionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blog: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<u64>,
}

impl DimensionSet {
    /// The unqualified "all" dimension set.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn blog(id: u64) -> Self {
        Self {
            blog: Some(id),
            ..Self::default()
        }
    }

    pub fn author(id: u64) -> Self {
        Self {
            author: Some(id),
            ..Self::default()
        }
    }

    pub fn country(code: &str) -> Result<Self> {
        Ok(Self {
            country: Some(normalize_country(code)?),
            ..Self::default()
        })
    }

    pub fn is_all(&self) -> bool {
        self.blog.is_none() && self.country.is_none() && self.author.is_none()
    }

    /// Return a copy with `dimension` set from its string form.
    pub fn with(mut self, dimension: Dimension, value: &str) -> Result<Self> {
        let bad_value = || AnalyticsError::InvalidDimensionValue {
            dimension: dimension.as_str().to_string(),
            value: value.to_string(),
        };
        match dimension {
            Dimension::Blog => self.blog = Some(value.trim().parse().map_err(|_| bad_value())?),
            Dimension::Author => {
                self.author = Some(value.trim().parse().map_err(|_| bad_value())?)
            }
            Dimension::Country => self.country = Some(normalize_country(value)?),
        }
        Ok(self)
    }

    /// Build a set from `(name, value)` pairs, rejecting unknown names.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        pairs.into_iter().try_fold(Self::all(), |set, (name, value)| {
            set.with(name.parse()?, value)
        })
    }

    /// `true` when every dimension fixed by `self` matches the event.
    pub fn matches(&self, event: &RawEvent) -> bool {
        self.blog.map_or(true, |b| b == event.blog_id)
            && self.author.map_or(true, |a| a == event.author_id)
            && self.country.as_deref().map_or(true, |c| {
                event
                    .country
                    .as_deref()
                    .is_some_and(|ec| ec.eq_ignore_ascii_case(c))
            })
    }

    /// Number of dimensions fixed by this set.
    pub fn arity(&self) -> usize {
        usize::from(self.blog.is_some())
            + usize::from(self.country.is_some())
            + usize::from(self.author.is_some())
    }

    /// `true` when every dimension fixed by `self` is fixed to the same value
    /// in `other`.
    pub fn covers(&self, other: &DimensionSet) -> bool {
        fn agree<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            mine.as_ref().map_or(true, |m| theirs.as_ref() == Some(m))
        }
        agree(&self.blog, &other.blog)
            && agree(&self.country, &other.country)
            && agree(&self.author, &other.author)
    }

    /// Value of one dimension in display form.
    pub fn value_of(&self, dimension: Dimension) -> Option<String> {
        match dimension {
            Dimension::Blog => self.blog.map(|b| b.to_string()),
            Dimension::Country => self.country.clone(),
            Dimension::Author => self.author.map(|a| a.to_string()),
        }
    }

    /// Canonical text form used as a storage key, e.g. `blog=3,country=*,author=*`.
    pub fn storage_key(&self) -> String {
        fn part<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "*".to_string(), |x| x.to_string())
        }
        format!(
            "blog={},country={},author={}",
            part(&self.blog),
            part(&self.country),
            part(&self.author)
        )
    }
}

impl fmt::Display for DimensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("all")
        } else {
            f.write_str(&self.storage_key())
        }
    }
}

// ── Breakdown policy ──────────────────────────────────────────────────────────

/// Which dimension sets are computed for a bucket when the caller does not
/// name them explicitly. All sets of a bucket are always recomputed together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakdownPolicy {
    /// Only the "all" set.
    Totals,
    /// "all" plus one set per distinct blog, country and author.
    #[default]
    Single,
    /// `Single` plus the combined (blog, country, author) tuple.
    Full,
}

impl BreakdownPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakdownPolicy::Totals => "totals",
            BreakdownPolicy::Single => "single",
            BreakdownPolicy::Full => "full",
        }
    }

    /// Dimension sets to compute for the given bucket contents.
    ///
    /// The "all" set is always included so every aggregated bucket has a
    /// total, even when it is zero.
    pub fn dimension_sets<'a>(
        self,
        sets: impl IntoIterator<Item = &'a DimensionSet>,
    ) -> BTreeSet<DimensionSet> {
        let mut out = BTreeSet::new();
        out.insert(DimensionSet::all());
        if self == BreakdownPolicy::Totals {
            return out;
        }
        for full in sets {
            if let Some(blog) = full.blog {
                out.insert(DimensionSet::blog(blog));
            }
            if let Some(author) = full.author {
                out.insert(DimensionSet::author(author));
            }
            if let Some(country) = &full.country {
                out.insert(DimensionSet {
                    country: Some(country.clone()),
                    ..DimensionSet::default()
                });
            }
            if self == BreakdownPolicy::Full {
                out.insert(full.clone());
            }
        }
        out
    }
}

impl FromStr for BreakdownPolicy {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "totals" => Ok(BreakdownPolicy::Totals),
            "single" => Ok(BreakdownPolicy::Single),
            "full" => Ok(BreakdownPolicy::Full),
            other => Err(AnalyticsError::Config(format!(
                "unknown breakdown policy: {other}"
            ))),
        }
    }
}

// ── Aggregate records ─────────────────────────────────────────────────────────

/// Unique identity of an aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub kind: MetricKind,
    pub granularity: Granularity,
    /// Canonical start of the bucket (see [`crate::bucketing::bucket_for`]).
    pub bucket_start: DateTime<Utc>,
    pub dimensions: DimensionSet,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind,
            self.granularity,
            self.bucket_start.to_rfc3339(),
            self.dimensions
        )
    }
}

/// A persisted per-bucket summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub key: AggregateKey,
    /// Number of qualifying events in the bucket.
    pub count: u64,
    /// Distinct viewers, for view aggregates computed from raw events.
    #[serde(default)]
    pub unique_viewers: Option<u64>,
    /// Distinct blogs viewed, tracked alongside `unique_viewers`.
    #[serde(default)]
    pub unique_blogs: Option<u64>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
