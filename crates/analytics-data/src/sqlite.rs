//! SQLite-backed aggregate store.
//!
//! Table written: `time_series_aggregates`, primary key
//! `(kind, granularity, bucket_start, dims)` where `dims` is the canonical
//! [`DimensionSet::storage_key`]. Each upsert is one
//! `INSERT ... ON CONFLICT DO UPDATE` statement, run together with its
//! existence check inside a `BEGIN IMMEDIATE` transaction.

use std::path::Path;
use std::sync::Mutex;

use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{
    AggregateKey, AggregateRecord, DimensionSet, Granularity, MetricKind,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::store::{AggregateStore, UpsertOutcome};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS time_series_aggregates (
    kind            TEXT    NOT NULL,
    granularity     TEXT    NOT NULL,
    bucket_start    INTEGER NOT NULL,
    dims            TEXT    NOT NULL,
    blog_id         INTEGER,
    country         TEXT,
    author_id       INTEGER,
    count           INTEGER NOT NULL,
    unique_viewers  INTEGER,
    unique_blogs    INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (kind, granularity, bucket_start, dims)
);
CREATE INDEX IF NOT EXISTS idx_tsa_series
    ON time_series_aggregates (kind, granularity, dims, bucket_start);
"#;

const SELECT_COLUMNS: &str = "kind, granularity, bucket_start, blog_id, country, author_id, \
                              count, unique_viewers, updated_at, unique_blogs";

/// Durable [`AggregateStore`] over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        // WAL lets the query path read while a backfill writes.
        conn.pragma_update(None, "journal_mode", "WAL").map_err(storage)?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        migrate(&conn)?;
        tracing::debug!("aggregate schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AnalyticsError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

/// Databases created before distinct-blog tracking lack `unique_blogs`.
fn migrate(conn: &Connection) -> Result<()> {
    let has_unique_blogs = conn
        .prepare("SELECT 1 FROM pragma_table_info('time_series_aggregates') WHERE name = 'unique_blogs'")
        .and_then(|mut stmt| stmt.exists([]))
        .map_err(storage)?;
    if !has_unique_blogs {
        tracing::info!("adding unique_blogs column to time_series_aggregates");
        conn.execute_batch("ALTER TABLE time_series_aggregates ADD COLUMN unique_blogs INTEGER")
            .map_err(storage)?;
    }
    Ok(())
}

fn storage(e: rusqlite::Error) -> AnalyticsError {
    AnalyticsError::Storage(e.to_string())
}

/// Busy/locked databases are transient; everything else is a hard failure.
fn write_error(e: rusqlite::Error, key: &AggregateKey) -> AnalyticsError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            AnalyticsError::WriteConflict {
                key: key.to_string(),
                attempts: 1,
            }
        }
        _ => storage(e),
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AggregateRecord> {
    let bad = |idx: usize, what: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            what.into(),
        )
    };

    let kind: String = row.get(0)?;
    let granularity: String = row.get(1)?;
    let bucket_start: i64 = row.get(2)?;
    let updated_at: i64 = row.get(8)?;

    Ok(AggregateRecord {
        key: AggregateKey {
            kind: kind.parse::<MetricKind>().map_err(|e| bad(0, e.to_string()))?,
            granularity: granularity
                .parse::<Granularity>()
                .map_err(|e| bad(1, e.to_string()))?,
            bucket_start: DateTime::from_timestamp(bucket_start, 0)
                .ok_or_else(|| bad(2, format!("bucket_start out of range: {bucket_start}")))?,
            dimensions: DimensionSet {
                blog: row.get::<_, Option<i64>>(3)?.map(to_u64),
                country: row.get(4)?,
                author: row.get::<_, Option<i64>>(5)?.map(to_u64),
            },
        },
        count: to_u64(row.get(6)?),
        unique_viewers: row.get::<_, Option<i64>>(7)?.map(to_u64),
        unique_blogs: row.get::<_, Option<i64>>(9)?.map(to_u64),
        updated_at: DateTime::from_timestamp_millis(updated_at)
            .ok_or_else(|| bad(8, format!("updated_at out of range: {updated_at}")))?,
    })
}

impl AggregateStore for SqliteStore {
    fn upsert(&self, record: AggregateRecord) -> Result<UpsertOutcome> {
        let mut conn = self.lock()?;
        let key = &record.key;
        let dims = key.dimensions.storage_key();
        let bucket = key.bucket_start.timestamp();

        // IMMEDIATE takes the write lock up front, so no other connection can
        // insert the key between the check and the upsert.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_error(e, key))?;

        let existed = tx
            .prepare_cached(
                "SELECT 1 FROM time_series_aggregates
                 WHERE kind = ?1 AND granularity = ?2 AND bucket_start = ?3 AND dims = ?4",
            )
            .and_then(|mut stmt| {
                stmt.exists(params![key.kind.as_str(), key.granularity.as_str(), bucket, dims])
            })
            .map_err(|e| write_error(e, key))?;

        let now = record.updated_at.timestamp_millis();
        tx.prepare_cached(
            r#"
            INSERT INTO time_series_aggregates (
                kind, granularity, bucket_start, dims,
                blog_id, country, author_id,
                count, unique_viewers, unique_blogs, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT(kind, granularity, bucket_start, dims) DO UPDATE SET
                count = excluded.count,
                unique_viewers = excluded.unique_viewers,
                unique_blogs = excluded.unique_blogs,
                updated_at = excluded.updated_at
            "#,
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                key.kind.as_str(),
                key.granularity.as_str(),
                bucket,
                dims,
                key.dimensions.blog.map(to_i64),
                key.dimensions.country,
                key.dimensions.author.map(to_i64),
                to_i64(record.count),
                record.unique_viewers.map(to_i64),
                record.unique_blogs.map(to_i64),
                now,
            ])
        })
        .map_err(|e| write_error(e, key))?;
        tx.commit().map_err(|e| write_error(e, key))?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM time_series_aggregates
             WHERE kind = ?1 AND granularity = ?2 AND bucket_start = ?3 AND dims = ?4"
        );
        conn.query_row(
            &sql,
            params![
                key.kind.as_str(),
                key.granularity.as_str(),
                key.bucket_start.timestamp(),
                key.dimensions.storage_key()
            ],
            row_to_record,
        )
        .optional()
        .map_err(storage)
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
        let conn = self.lock()?;
        // Buckets start on whole seconds; round the bounds up so sub-second
        // edges keep half-open semantics.
        let lo = ceil_seconds(start);
        let hi = ceil_seconds(end);

        let rows = match dimensions {
            Some(dims) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM time_series_aggregates
                     WHERE kind = ?1 AND granularity = ?2 AND dims = ?3
                       AND bucket_start >= ?4 AND bucket_start < ?5
                     ORDER BY bucket_start"
                );
                let mut stmt = conn.prepare_cached(&sql).map_err(storage)?;
                let rows = stmt
                    .query_map(
                        params![kind.as_str(), granularity.as_str(), dims.storage_key(), lo, hi],
                        row_to_record,
                    )
                    .map_err(storage)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage)?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM time_series_aggregates
                     WHERE kind = ?1 AND granularity = ?2
                       AND bucket_start >= ?3 AND bucket_start < ?4
                     ORDER BY bucket_start, dims"
                );
                let mut stmt = conn.prepare_cached(&sql).map_err(storage)?;
                let rows = stmt
                    .query_map(
                        params![kind.as_str(), granularity.as_str(), lo, hi],
                        row_to_record,
                    )
                    .map_err(storage)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage)?;
                rows
            }
        };
        Ok(rows)
    }

    fn clear(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let removed = match range {
            Some((start, end)) => conn.execute(
                "DELETE FROM time_series_aggregates
                 WHERE kind = ?1 AND granularity = ?2
                   AND bucket_start >= ?3 AND bucket_start < ?4",
                params![
                    kind.as_str(),
                    granularity.as_str(),
                    ceil_seconds(start),
                    ceil_seconds(end)
                ],
            ),
            None => conn.execute(
                "DELETE FROM time_series_aggregates WHERE kind = ?1 AND granularity = ?2",
                params![kind.as_str(), granularity.as_str()],
            ),
        }
        .map_err(storage)?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM time_series_aggregates", [], |r| r.get(0))
            .map_err(storage)?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

fn ceil_seconds(ts: DateTime<Utc>) -> i64 {
    if ts.timestamp_subsec_nanos() > 0 {
        ts.timestamp() + 1
    } else {
        ts.timestamp()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
