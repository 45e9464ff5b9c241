//! Warehouse gateway, retry kernel, and scan-history store for SPIRE.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use spire_core::{
    DescriptionTemplate, JobResult, MetricKey, MetricRecord, PagePerformance, PageType,
    ScanRecord, SnapshotRecord, SnapshotStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spire-store";

pub const DEFAULT_SCHEMA: &str = "seo";
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 500;

const METRICS_TABLE: &str = "search_metrics";
const SNAPSHOTS_TABLE: &str = "page_snapshots";
const JOB_RUNS_TABLE: &str = "job_runs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Auth,
    NotFound,
    RateLimited,
    Transient,
}

/// Error taxonomy for the engine. Entity-scoped (`Upstream`) and
/// table-scoped (`Persistence`) failures carry their scope so one bad site
/// or table is attributable without stopping the others.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream {kind:?} error for {site}: {message}")]
    Upstream {
        site: String,
        kind: UpstreamErrorKind,
        message: String,
    },
    #[error("persistence failure on {table}: {source}")]
    Persistence {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("job {job} failed: {source}")]
    Job {
        job: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    /// Tag an unclassified error with the job it surfaced from. Errors that
    /// already carry a `SyncError` classification pass through unchanged.
    pub fn wrap(job: &str, err: anyhow::Error) -> Self {
        match err.downcast::<SyncError>() {
            Ok(classified) => classified,
            Err(other) => SyncError::Job {
                job: job.to_string(),
                source: other,
            },
        }
    }
}

fn persistence(table: &str, source: sqlx::Error) -> SyncError {
    SyncError::Persistence {
        table: table.to_string(),
        source,
    }
}

fn decode_violation(table: &str, message: String) -> SyncError {
    persistence(table, sqlx::Error::Decode(message.into()))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based):
    /// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64 * factor).round();
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Run `operation` up to `max_attempts` times with geometric backoff,
/// re-raising the last error on exhaustion. Retryability is uniform: every
/// failure is retried the same way regardless of its classification.
pub async fn retry<T, F, Fut>(
    job_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt < attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        job = job_name,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; will retry"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(
                        job = job_name,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "attempt failed; retries exhausted"
                    );
                    last_error = Some(err);
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt always runs"))
}

/// Schema and table names are interpolated into SQL; values never are.
/// Only plain identifiers are accepted for interpolation.
pub fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub schema: String,
    pub upsert_chunk_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
        }
    }
}

/// Single choke point for analytical-store persistence.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Batched merge keyed by `(date, site, page, query)`; full-row
    /// overwrite on conflict. Returns the number of rows applied.
    async fn upsert_metrics(&self, records: &[MetricRecord]) -> Result<usize, SyncError>;

    /// Insert-if-absent keyed by `(site, page, captured_on)`. Returns the
    /// number of rows actually inserted; existing rows are left untouched.
    async fn insert_pending_snapshots(
        &self,
        snapshots: &[SnapshotRecord],
    ) -> Result<usize, SyncError>;

    /// Pending snapshots with `captured_on` on or before `cutoff`, ordered
    /// by `(captured_on, site, page)`.
    async fn pending_snapshots_through(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<SnapshotRecord>, SyncError>;

    /// Flip a pending snapshot to complete with its joined performance.
    /// Returns false when the snapshot is absent or already complete.
    async fn complete_snapshot(&self, id: Uuid, perf: &PagePerformance)
        -> Result<bool, SyncError>;

    /// Aggregated performance for one `(site, page, date)`, or `None` when
    /// no metric rows exist for that exact key.
    async fn metrics_for_page(
        &self,
        site: &str,
        page: &str,
        date: NaiveDate,
    ) -> Result<Option<PagePerformance>, SyncError>;

    /// Pages ranked by total clicks for `site` since `since`, capped at
    /// `limit`. Ties break by page URL for deterministic output.
    async fn top_pages_by_clicks(
        &self,
        site: &str,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>, SyncError>;

    async fn snapshot_count_on(&self, date: NaiveDate) -> Result<i64, SyncError>;

    async fn stale_pending_count(&self, cutoff: NaiveDate) -> Result<i64, SyncError>;

    async fn insert_job_result(&self, result: &JobResult) -> Result<(), SyncError>;

    /// Idempotent DDL for the configured namespace.
    async fn ensure_schema(&self) -> Result<(), SyncError>;
}

/// Production warehouse over Postgres.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    schema: String,
    chunk_size: usize,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, config: WarehouseConfig) -> Result<Self, SyncError> {
        if !valid_identifier(&config.schema) {
            return Err(SyncError::Configuration(format!(
                "invalid warehouse schema name '{}'",
                config.schema
            )));
        }
        Ok(Self {
            pool,
            schema: config.schema,
            chunk_size: config.upsert_chunk_size.max(1),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn upsert_metric_chunk(&self, chunk: &[MetricRecord]) -> Result<u64, SyncError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (date, site, page, \"query\", clicks, impressions, ctr, \"position\") ",
            self.table(METRICS_TABLE)
        ));
        builder.push_values(chunk, |mut row, record| {
            row.push_bind(record.date)
                .push_bind(record.site.clone())
                .push_bind(record.page.clone())
                .push_bind(record.query.clone())
                .push_bind(record.clicks)
                .push_bind(record.impressions)
                .push_bind(record.ctr)
                .push_bind(record.position);
        });
        builder.push(
            " ON CONFLICT (date, site, page, \"query\") DO UPDATE SET \
             clicks = EXCLUDED.clicks, impressions = EXCLUDED.impressions, \
             ctr = EXCLUDED.ctr, \"position\" = EXCLUDED.\"position\"",
        );
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| persistence(METRICS_TABLE, e))?;
        Ok(result.rows_affected())
    }

    async fn insert_snapshot_chunk(&self, chunk: &[SnapshotRecord]) -> Result<u64, SyncError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (id, site, page, captured_on, page_type, template, status, \
             impressions, clicks, ctr, \"position\") ",
            self.table(SNAPSHOTS_TABLE)
        ));
        builder.push_values(chunk, |mut row, snap| {
            row.push_bind(snap.id)
                .push_bind(snap.site.clone())
                .push_bind(snap.page.clone())
                .push_bind(snap.captured_on)
                .push_bind(snap.page_type.as_str())
                .push_bind(snap.template.as_str())
                .push_bind(snap.status.as_str())
                .push_bind(snap.impressions)
                .push_bind(snap.clicks)
                .push_bind(snap.ctr)
                .push_bind(snap.position);
        });
        builder.push(" ON CONFLICT (site, page, captured_on) DO NOTHING");
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
        Ok(result.rows_affected())
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<SnapshotRecord, SyncError> {
    let page_type_raw: String = row
        .try_get("page_type")
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
    let page_type = PageType::parse(&page_type_raw).ok_or_else(|| {
        decode_violation(SNAPSHOTS_TABLE, format!("unknown page_type '{page_type_raw}'"))
    })?;
    let template_raw: String = row
        .try_get("template")
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
    let template = DescriptionTemplate::parse(&template_raw).ok_or_else(|| {
        decode_violation(SNAPSHOTS_TABLE, format!("unknown template '{template_raw}'"))
    })?;
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
    let status = SnapshotStatus::parse(&status_raw).ok_or_else(|| {
        decode_violation(SNAPSHOTS_TABLE, format!("unknown status '{status_raw}'"))
    })?;

    Ok(SnapshotRecord {
        id: row.try_get("id").map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        site: row
            .try_get("site")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        page: row
            .try_get("page")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        captured_on: row
            .try_get("captured_on")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        page_type,
        template,
        status,
        impressions: row
            .try_get("impressions")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        clicks: row
            .try_get("clicks")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        ctr: row
            .try_get("ctr")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
        position: row
            .try_get("position")
            .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn upsert_metrics(&self, records: &[MetricRecord]) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut applied = 0usize;
        for chunk in records.chunks(self.chunk_size) {
            applied += self.upsert_metric_chunk(chunk).await? as usize;
        }
        debug!(rows = records.len(), applied, "metric upsert finished");
        Ok(applied)
    }

    async fn insert_pending_snapshots(
        &self,
        snapshots: &[SnapshotRecord],
    ) -> Result<usize, SyncError> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0usize;
        for chunk in snapshots.chunks(self.chunk_size) {
            inserted += self.insert_snapshot_chunk(chunk).await? as usize;
        }
        Ok(inserted)
    }

    async fn pending_snapshots_through(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<SnapshotRecord>, SyncError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, site, page, captured_on, page_type, template, status,
                   impressions, clicks, ctr, "position"
              FROM {}
             WHERE status = 'pending'
               AND captured_on <= $1
             ORDER BY captured_on, site, page
            "#,
            self.table(SNAPSHOTS_TABLE)
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn complete_snapshot(
        &self,
        id: Uuid,
        perf: &PagePerformance,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
               SET status = 'complete',
                   impressions = $2,
                   clicks = $3,
                   ctr = $4,
                   "position" = $5
             WHERE id = $1
               AND status = 'pending'
            "#,
            self.table(SNAPSHOTS_TABLE)
        ))
        .bind(id)
        .bind(perf.impressions)
        .bind(perf.clicks)
        .bind(perf.ctr)
        .bind(perf.position)
        .execute(&self.pool)
        .await
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn metrics_for_page(
        &self,
        site: &str,
        page: &str,
        date: NaiveDate,
    ) -> Result<Option<PagePerformance>, SyncError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT SUM(clicks)::bigint AS clicks,
                   SUM(impressions)::bigint AS impressions,
                   CASE WHEN SUM(impressions) > 0
                        THEN SUM(clicks)::float8 / SUM(impressions)::float8
                        ELSE 0.0 END AS ctr,
                   CASE WHEN SUM(impressions) > 0
                        THEN SUM("position" * impressions::float8) / SUM(impressions)::float8
                        ELSE AVG("position") END AS "position"
              FROM {}
             WHERE site = $1
               AND page = $2
               AND date = $3
            "#,
            self.table(METRICS_TABLE)
        ))
        .bind(site)
        .bind(page)
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| persistence(METRICS_TABLE, e))?;

        let clicks: Option<i64> = row
            .try_get("clicks")
            .map_err(|e| persistence(METRICS_TABLE, e))?;
        let Some(clicks) = clicks else {
            return Ok(None);
        };
        let impressions: i64 = row
            .try_get::<Option<i64>, _>("impressions")
            .map_err(|e| persistence(METRICS_TABLE, e))?
            .unwrap_or(0);
        let ctr: f64 = row
            .try_get::<Option<f64>, _>("ctr")
            .map_err(|e| persistence(METRICS_TABLE, e))?
            .unwrap_or(0.0);
        let position: f64 = row
            .try_get::<Option<f64>, _>("position")
            .map_err(|e| persistence(METRICS_TABLE, e))?
            .unwrap_or(0.0);
        Ok(Some(PagePerformance {
            clicks,
            impressions,
            ctr,
            position,
        }))
    }

    async fn top_pages_by_clicks(
        &self,
        site: &str,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT page
              FROM {}
             WHERE site = $1
               AND date >= $2
             GROUP BY page
             ORDER BY SUM(clicks) DESC, page
             LIMIT $3
            "#,
            self.table(METRICS_TABLE)
        ))
        .bind(site)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| persistence(METRICS_TABLE, e))?;

        rows.iter()
            .map(|row| row.try_get("page").map_err(|e| persistence(METRICS_TABLE, e)))
            .collect()
    }

    async fn snapshot_count_on(&self, date: NaiveDate) -> Result<i64, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE captured_on = $1",
            self.table(SNAPSHOTS_TABLE)
        ))
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
        row.try_get("n").map_err(|e| persistence(SNAPSHOTS_TABLE, e))
    }

    async fn stale_pending_count(&self, cutoff: NaiveDate) -> Result<i64, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE status = 'pending' AND captured_on <= $1",
            self.table(SNAPSHOTS_TABLE)
        ))
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| persistence(SNAPSHOTS_TABLE, e))?;
        row.try_get("n").map_err(|e| persistence(SNAPSHOTS_TABLE, e))
    }

    async fn insert_job_result(&self, result: &JobResult) -> Result<(), SyncError> {
        let outcomes = serde_json::to_value(&result.outcomes).map_err(|e| {
            decode_violation(JOB_RUNS_TABLE, format!("encoding outcomes: {e}"))
        })?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (run_id, job, status, started_at, duration_ms, outcomes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO NOTHING
            "#,
            self.table(JOB_RUNS_TABLE)
        ))
        .bind(result.run_id)
        .bind(&result.job)
        .bind(result.status.as_str())
        .bind(result.started_at)
        .bind(result.duration_ms as i64)
        .bind(outcomes)
        .execute(&self.pool)
        .await
        .map_err(|e| persistence(JOB_RUNS_TABLE, e))?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), SyncError> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    date date NOT NULL,
                    site text NOT NULL,
                    page text NOT NULL,
                    "query" text NOT NULL,
                    clicks bigint NOT NULL,
                    impressions bigint NOT NULL,
                    ctr float8 NOT NULL,
                    "position" float8 NOT NULL,
                    PRIMARY KEY (date, site, page, "query")
                )
                "#,
                self.table(METRICS_TABLE)
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id uuid PRIMARY KEY,
                    site text NOT NULL,
                    page text NOT NULL,
                    captured_on date NOT NULL,
                    page_type text NOT NULL,
                    template text NOT NULL,
                    status text NOT NULL,
                    impressions bigint,
                    clicks bigint,
                    ctr float8,
                    "position" float8,
                    UNIQUE (site, page, captured_on)
                )
                "#,
                self.table(SNAPSHOTS_TABLE)
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    run_id uuid PRIMARY KEY,
                    job text NOT NULL,
                    status text NOT NULL,
                    started_at timestamptz NOT NULL,
                    duration_ms bigint NOT NULL,
                    outcomes jsonb NOT NULL
                )
                "#,
                self.table(JOB_RUNS_TABLE)
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS search_metrics_site_date_idx ON {} (site, date)",
                self.table(METRICS_TABLE)
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS page_snapshots_status_idx ON {} (status, captured_on)",
                self.table(SNAPSHOTS_TABLE)
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| persistence("schema", e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    metrics: HashMap<MetricKey, MetricRecord>,
    snapshots: Vec<SnapshotRecord>,
    job_results: Vec<JobResult>,
    chunks_applied: usize,
    fail_after_chunks: Option<usize>,
}

/// In-memory warehouse with the same merge semantics as [`PgWarehouse`].
/// Used by job tests; chunk-failure injection exercises partial-batch
/// behavior without a database.
#[derive(Debug)]
pub struct MemoryWarehouse {
    chunk_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_UPSERT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Make upserts fail once `chunks` chunks have been applied.
    pub async fn fail_upserts_after_chunks(&self, chunks: usize) {
        self.state.lock().await.fail_after_chunks = Some(chunks);
    }

    pub async fn metric_count(&self) -> usize {
        self.state.lock().await.metrics.len()
    }

    pub async fn metrics_sorted(&self) -> Vec<MetricRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<MetricRecord> = state.metrics.values().cloned().collect();
        records.sort_by_key(MetricRecord::key);
        records
    }

    pub async fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.state.lock().await.snapshots.clone()
    }

    pub async fn job_results(&self) -> Vec<JobResult> {
        self.state.lock().await.job_results.clone()
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn upsert_metrics(&self, records: &[MetricRecord]) -> Result<usize, SyncError> {
        let mut state = self.state.lock().await;
        let mut applied = 0usize;
        for chunk in records.chunks(self.chunk_size) {
            if let Some(limit) = state.fail_after_chunks {
                if state.chunks_applied >= limit {
                    return Err(persistence(
                        METRICS_TABLE,
                        sqlx::Error::Io(std::io::Error::other("injected upsert failure")),
                    ));
                }
            }
            for record in chunk {
                state.metrics.insert(record.key(), record.clone());
            }
            state.chunks_applied += 1;
            applied += chunk.len();
        }
        Ok(applied)
    }

    async fn insert_pending_snapshots(
        &self,
        snapshots: &[SnapshotRecord],
    ) -> Result<usize, SyncError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0usize;
        for snap in snapshots {
            let exists = state.snapshots.iter().any(|s| {
                s.site == snap.site && s.page == snap.page && s.captured_on == snap.captured_on
            });
            if !exists {
                state.snapshots.push(snap.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn pending_snapshots_through(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<SnapshotRecord>, SyncError> {
        let state = self.state.lock().await;
        let mut due: Vec<SnapshotRecord> = state
            .snapshots
            .iter()
            .filter(|s| s.status == SnapshotStatus::Pending && s.captured_on <= cutoff)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.captured_on, &a.site, &a.page).cmp(&(b.captured_on, &b.site, &b.page))
        });
        Ok(due)
    }

    async fn complete_snapshot(
        &self,
        id: Uuid,
        perf: &PagePerformance,
    ) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        match state.snapshots.iter_mut().find(|s| s.id == id) {
            Some(snap) if snap.status == SnapshotStatus::Pending => {
                snap.status = SnapshotStatus::Complete;
                snap.impressions = Some(perf.impressions);
                snap.clicks = Some(perf.clicks);
                snap.ctr = Some(perf.ctr);
                snap.position = Some(perf.position);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn metrics_for_page(
        &self,
        site: &str,
        page: &str,
        date: NaiveDate,
    ) -> Result<Option<PagePerformance>, SyncError> {
        let state = self.state.lock().await;
        Ok(PagePerformance::aggregate(
            state
                .metrics
                .values()
                .filter(|m| m.site == site && m.page == page && m.date == date),
        ))
    }

    async fn top_pages_by_clicks(
        &self,
        site: &str,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>, SyncError> {
        let state = self.state.lock().await;
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for record in state.metrics.values() {
            if record.site == site && record.date >= since {
                *totals.entry(record.page.as_str()).or_default() += record.clicks;
            }
        }
        let mut ranked: Vec<(&str, i64)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(page, _)| page.to_string())
            .collect())
    }

    async fn snapshot_count_on(&self, date: NaiveDate) -> Result<i64, SyncError> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.captured_on == date)
            .count() as i64)
    }

    async fn stale_pending_count(&self, cutoff: NaiveDate) -> Result<i64, SyncError> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.status == SnapshotStatus::Pending && s.captured_on <= cutoff)
            .count() as i64)
    }

    async fn insert_job_result(&self, result: &JobResult) -> Result<(), SyncError> {
        self.state.lock().await.job_results.push(result.clone());
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Filesystem-safe slug for a site URL: lowercase alphanumerics with `-`
/// separators, no leading or trailing dash.
pub fn site_slug(site: &str) -> String {
    let mut slug = String::with_capacity(site.len());
    let mut last_dash = true;
    for ch in site.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Append-only scan history: one JSON document per scan at
/// `<root>/<site-slug>/<scan_id>.json`, written atomically and never
/// mutated afterward.
#[derive(Debug, Clone)]
pub struct ScanStore {
    root: PathBuf,
}

impl ScanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn append(&self, scan: &ScanRecord) -> anyhow::Result<PathBuf> {
        let slug = site_slug(&scan.site);
        anyhow::ensure!(!slug.is_empty(), "site '{}' yields an empty slug", scan.site);
        let dir = self.root.join(&slug);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating scan directory {}", dir.display()))?;

        let path = dir.join(format!("{}.json", scan.scan_id));
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking scan path {}", path.display()))?
        {
            anyhow::bail!(
                "scan {} for {} already recorded; scan history is append-only",
                scan.scan_id,
                scan.site
            );
        }

        let body = serde_json::to_vec_pretty(scan).context("encoding scan document")?;
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp scan file {}", temp_path.display()))?;
        file.write_all(&body)
            .await
            .with_context(|| format!("writing temp scan file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp scan file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp scan {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    /// Most recent scans for a site, newest first. Missing history yields
    /// an empty list, not an error.
    pub async fn latest_scans(&self, site: &str, limit: usize) -> anyhow::Result<Vec<ScanRecord>> {
        let dir = self.root.join(site_slug(site));
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking scan directory {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing scan directory {}", dir.display()))?;
        let mut scans = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing scan directory {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = fs::read(&path)
                .await
                .with_context(|| format!("reading scan file {}", path.display()))?;
            let scan: ScanRecord = serde_json::from_slice(&body)
                .with_context(|| format!("decoding scan file {}", path.display()))?;
            scans.push(scan);
        }

        scans.sort_by(|a, b| {
            b.scanned_at
                .cmp(&a.scanned_at)
                .then_with(|| b.scan_id.cmp(&a.scan_id))
        });
        scans.truncate(limit);
        Ok(scans)
    }

    pub async fn scan_by_id(&self, site: &str, scan_id: Uuid) -> anyhow::Result<Option<ScanRecord>> {
        let path = self
            .root
            .join(site_slug(site))
            .join(format!("{scan_id}.json"));
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking scan path {}", path.display()))?
        {
            return Ok(None);
        }
        let body = fs::read(&path)
            .await
            .with_context(|| format!("reading scan file {}", path.display()))?;
        let scan = serde_json::from_slice(&body)
            .with_context(|| format!("decoding scan file {}", path.display()))?;
        Ok(Some(scan))
    }

    /// Site slugs with recorded history, sorted.
    pub async fn sites(&self) -> anyhow::Result<Vec<String>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking scan root {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing scan root {}", self.root.display()))?;
        let mut slugs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing scan root {}", self.root.display()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                slugs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}
