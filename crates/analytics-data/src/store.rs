//! The aggregate store: exclusive owner of [`AggregateRecord`] rows.
//!
//! Every implementation must make [`AggregateStore::upsert`] a single atomic
//! insert-or-update per key, so concurrent writers of one key converge on
//! exactly one row holding the last write.

use std::collections::BTreeMap;
use std::sync::RwLock;

use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{
    AggregateKey, AggregateRecord, DimensionSet, Granularity, MetricKind,
};
use chrono::{DateTime, Utc};

/// Whether an upsert created the row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Persisted per-granularity summary rows.
pub trait AggregateStore: Send + Sync {
    /// Insert the record, or overwrite the count of the row with the same key.
    fn upsert(&self, record: AggregateRecord) -> Result<UpsertOutcome>;

    fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>>;

    /// Records of `kind`/`granularity` with `start <= bucket_start < end`,
    /// ordered by bucket start. `dimensions` narrows to exactly one dimension
    /// set; `None` returns every set.
    fn fetch(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimensions: Option<&DimensionSet>,
    ) -> Result<Vec<AggregateRecord>>;

    /// Delete records of `kind`/`granularity`, optionally only those whose
    /// bucket start lies in `[start, end)`. Returns the number deleted.
    fn clear(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<usize>;

    /// Total number of stored records.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

/// Ordered in-memory store. Keys sort by kind, granularity, bucket start and
/// dimension set, so range scans are contiguous.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<AggregateKey, AggregateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row, in key order.
    pub fn snapshot(&self) -> Result<Vec<AggregateRecord>> {
        Ok(self.rows.read().map_err(|_| poisoned())?.values().cloned().collect())
    }
}

fn poisoned() -> AnalyticsError {
    AnalyticsError::Storage("aggregate store lock poisoned".to_string())
}

fn lower_bound(kind: MetricKind, granularity: Granularity, start: DateTime<Utc>) -> AggregateKey {
    AggregateKey {
        kind,
        granularity,
        bucket_start: start,
        // `None` sorts first, so the "all" set is the smallest dimension set.
        dimensions: DimensionSet::all(),
    }
}

impl AggregateStore for MemoryStore {
    fn upsert(&self, record: AggregateRecord) -> Result<UpsertOutcome> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let outcome = match rows.insert(record.key.clone(), record) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        Ok(outcome)
    }

    fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>> {
        Ok(self.rows.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn fetch(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimensions: Option<&DimensionSet>,
    ) -> Result<Vec<AggregateRecord>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .range(lower_bound(kind, granularity, start)..)
            .take_while(|(k, _)| {
                k.kind == kind && k.granularity == granularity && k.bucket_start < end
            })
            .filter(|(k, _)| dimensions.map_or(true, |d| &k.dimensions == d))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn clear(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<usize> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let before = rows.len();
        rows.retain(|k, _| {
            let in_scope = k.kind == kind
                && k.granularity == granularity
                && range.map_or(true, |(s, e)| s <= k.bucket_start && k.bucket_start < e);
            !in_scope
        });
        Ok(before - rows.len())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows.read().map_err(|_| poisoned())?.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
