//! Job orchestration: metric sync, snapshot lifecycle, scan deltas, and the
//! daily scheduler.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use spire_core::{
    BrokenLink, JobResult, MetricRecord, ScanRecord, SiteOutcome, SnapshotRecord,
    REPORTING_LAG_DAYS, STALE_PENDING_DAYS,
};
use spire_store::{
    retry, RetryPolicy, ScanStore, SyncError, Warehouse, WarehouseConfig, DEFAULT_SCHEMA,
    DEFAULT_UPSERT_CHUNK_SIZE,
};
use spire_upstream::{
    extract_site, DateWindow, PerformanceSource, ReportingClientConfig, RequestPacer,
};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spire-sync";

pub const SYNC_JOB: &str = "metric-sync";
pub const CAPTURE_JOB: &str = "snapshot-capture";
pub const COMPLETION_JOB: &str = "snapshot-completion";

/// Runtime configuration, read once at startup and handed to each component
/// at construction. No process-wide state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub upstream_base: String,
    pub upstream_token: String,
    pub user_agent: String,
    pub sites_file: PathBuf,
    pub scan_root: PathBuf,
    pub schema: String,
    pub page_size: usize,
    pub max_rows_per_site: usize,
    pub upsert_chunk_size: usize,
    pub max_concurrent_sites: usize,
    pub sync_window_days: u64,
    pub traffic_window_days: u64,
    pub snapshot_page_limit: usize,
    pub request_interval: Duration,
    pub http_timeout: Duration,
    pub run_timeout: Duration,
    pub retry: RetryPolicy,
    pub scheduler_enabled: bool,
    pub daily_cron: String,
}

impl EngineConfig {
    /// Read configuration from `SPIRE_*` environment variables. The two
    /// required settings fail fast with a configuration error before any
    /// I/O happens; everything else falls back to a default.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = require(&get, "SPIRE_DATABASE_URL")?;
        let upstream_token = require(&get, "SPIRE_UPSTREAM_TOKEN")?;
        Ok(Self {
            database_url,
            upstream_token,
            upstream_base: get("SPIRE_UPSTREAM_BASE")
                .unwrap_or_else(|| ReportingClientConfig::default().base_url),
            user_agent: get("SPIRE_USER_AGENT").unwrap_or_else(|| "spire/0.1".to_string()),
            sites_file: get("SPIRE_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sites.yaml")),
            scan_root: get("SPIRE_SCAN_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./scans")),
            schema: get("SPIRE_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            page_size: parse_var(&get, "SPIRE_PAGE_SIZE", 1000),
            max_rows_per_site: parse_var(&get, "SPIRE_MAX_ROWS_PER_SITE", 25_000),
            upsert_chunk_size: parse_var(
                &get,
                "SPIRE_UPSERT_CHUNK_SIZE",
                DEFAULT_UPSERT_CHUNK_SIZE,
            ),
            max_concurrent_sites: parse_var(&get, "SPIRE_MAX_CONCURRENT_SITES", 4),
            sync_window_days: parse_var(&get, "SPIRE_SYNC_WINDOW_DAYS", 3),
            traffic_window_days: parse_var(&get, "SPIRE_TRAFFIC_WINDOW_DAYS", 28),
            snapshot_page_limit: parse_var(&get, "SPIRE_SNAPSHOT_PAGE_LIMIT", 50),
            request_interval: Duration::from_millis(parse_var(
                &get,
                "SPIRE_REQUEST_INTERVAL_MS",
                250,
            )),
            http_timeout: Duration::from_secs(parse_var(&get, "SPIRE_HTTP_TIMEOUT_SECS", 30)),
            run_timeout: Duration::from_secs(parse_var(&get, "SPIRE_RUN_TIMEOUT_SECS", 600)),
            retry: RetryPolicy::default(),
            scheduler_enabled: get("SPIRE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            daily_cron: get("SPIRE_DAILY_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        WarehouseConfig {
            schema: self.schema.clone(),
            upsert_chunk_size: self.upsert_chunk_size,
        }
    }

    pub fn reporting_client_config(&self) -> ReportingClientConfig {
        ReportingClientConfig {
            base_url: self.upstream_base.clone(),
            token: self.upstream_token.clone(),
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn require<F>(get: &F, key: &str) -> Result<String, SyncError>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| SyncError::Configuration(format!("{key} is not set")))
}

fn parse_var<T, F>(get: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Site registry file. Disabled entries stay listed for operators but are
/// skipped by every job.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteEntry {
    pub site_url: String,
    pub enabled: bool,
}

impl SiteRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sites(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.site_url.clone())
            .collect()
    }
}

/// One cadence problem found by the health check. These are reported values,
/// not errors: the check mutates nothing and flags each kind independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StalenessViolation {
    NoSnapshotToday { date: NaiveDate },
    NoSnapshotYesterday { date: NaiveDate },
    StalePending { count: i64, cutoff: NaiveDate },
}

impl fmt::Display for StalenessViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StalenessViolation::NoSnapshotToday { date } => {
                write!(f, "no snapshot captured today ({date})")
            }
            StalenessViolation::NoSnapshotYesterday { date } => {
                write!(f, "no snapshot captured yesterday ({date})")
            }
            StalenessViolation::StalePending { count, cutoff } => {
                write!(f, "{count} snapshot(s) pending since {cutoff} or earlier")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checked_on: NaiveDate,
    pub violations: Vec<StalenessViolation>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Broken-link difference between two scans of the same site.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanDelta {
    pub site: String,
    pub from_scan: Uuid,
    pub to_scan: Uuid,
    pub from_scanned_at: DateTime<Utc>,
    pub to_scanned_at: DateTime<Utc>,
    pub added: Vec<BrokenLink>,
    pub removed: Vec<BrokenLink>,
    pub unchanged: Vec<BrokenLink>,
}

/// With fewer than two scans on record there is nothing to compare; the
/// delta is reported unavailable rather than fabricated.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    Computed(ScanDelta),
    Unavailable { scans_found: usize },
}

/// Set difference between two scans' broken-link lists, keyed by the
/// `(source, target)` identity. The coarse `broken_url_count` counters play
/// no part: the detail lists are authoritative when the two diverge. Output
/// lists are sorted by identity and deduplicated.
pub fn delta_between(from: &ScanRecord, to: &ScanRecord) -> ScanDelta {
    let from_keys: HashSet<(&str, &str)> =
        from.broken_links.iter().map(BrokenLink::identity).collect();
    let to_keys: HashSet<(&str, &str)> =
        to.broken_links.iter().map(BrokenLink::identity).collect();

    let mut added: Vec<BrokenLink> = to
        .broken_links
        .iter()
        .filter(|link| !from_keys.contains(&link.identity()))
        .cloned()
        .collect();
    let mut removed: Vec<BrokenLink> = from
        .broken_links
        .iter()
        .filter(|link| !to_keys.contains(&link.identity()))
        .cloned()
        .collect();
    let mut unchanged: Vec<BrokenLink> = to
        .broken_links
        .iter()
        .filter(|link| from_keys.contains(&link.identity()))
        .cloned()
        .collect();

    for list in [&mut added, &mut removed, &mut unchanged] {
        list.sort_by(|a, b| a.identity().cmp(&b.identity()));
        list.dedup_by(|a, b| a.identity() == b.identity());
    }

    ScanDelta {
        site: to.site.clone(),
        from_scan: from.scan_id,
        to_scan: to.scan_id,
        from_scanned_at: from.scanned_at,
        to_scanned_at: to.scanned_at,
        added,
        removed,
        unchanged,
    }
}

/// Load the two most recent scans for `site` and compute their delta.
pub async fn reconstruct_delta(store: &ScanStore, site: &str) -> Result<DeltaOutcome> {
    let scans = store.latest_scans(site, 2).await?;
    if scans.len() < 2 {
        return Ok(DeltaOutcome::Unavailable {
            scans_found: scans.len(),
        });
    }
    Ok(DeltaOutcome::Computed(delta_between(&scans[1], &scans[0])))
}

/// Orchestrates the daily jobs over the warehouse and the upstream source.
pub struct SyncEngine {
    config: EngineConfig,
    sites: Vec<String>,
    warehouse: Arc<dyn Warehouse>,
    source: Arc<dyn PerformanceSource>,
    pacer: RequestPacer,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        sites: Vec<String>,
        warehouse: Arc<dyn Warehouse>,
        source: Arc<dyn PerformanceSource>,
    ) -> Self {
        let pacer = RequestPacer::new(config.request_interval);
        Self {
            config,
            sites,
            warehouse,
            source,
            pacer,
        }
    }

    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    /// Ingestion window for a sync run: `days` report dates ending at the
    /// newest date the upstream can serve (today minus the reporting lag).
    pub fn sync_window(&self, days: u64) -> DateWindow {
        let end = Utc::now().date_naive() - Days::new(REPORTING_LAG_DAYS);
        DateWindow::trailing(end, days.max(1))
    }

    /// Extract, validate, and upsert every configured site for `window`.
    /// Sites run through a bounded worker pool and fail independently; the
    /// whole run is bounded by `run_timeout`, keeping finished outcomes and
    /// marking unfinished sites failed.
    pub async fn run_sync(&self, window: DateWindow) -> Result<JobResult, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            job = SYNC_JOB,
            run = %run_id,
            sites = self.sites.len(),
            start = %window.start,
            end = %window.end,
            "starting sync run"
        );

        let collected = Mutex::new(Vec::with_capacity(self.sites.len()));
        let work = async {
            // Collected eagerly: keeping the lazy closure-over-&site iterator
            // alive across the await trips rustc's higher-ranked `Send` check
            // (rust-lang/rust#89976). Futures stay inert until polled, so the
            // concurrency bound below is unchanged.
            let site_futures: Vec<_> = self
                .sites
                .iter()
                .map(|site| self.sync_site(site, window))
                .collect();
            let mut in_flight = stream::iter(site_futures)
                .buffer_unordered(self.config.max_concurrent_sites.max(1));
            while let Some(outcome) = in_flight.next().await {
                collected.lock().await.push(outcome);
            }
        };
        if tokio::time::timeout(self.config.run_timeout, work)
            .await
            .is_err()
        {
            warn!(
                job = SYNC_JOB,
                timeout_secs = self.config.run_timeout.as_secs(),
                "run timed out; abandoning in-flight sites"
            );
        }

        let mut outcomes = collected.into_inner();
        for site in &self.sites {
            if !outcomes.iter().any(|o| &o.site == site) {
                outcomes.push(SiteOutcome::failed(
                    site,
                    format!("run timed out after {}s", self.config.run_timeout.as_secs()),
                ));
            }
        }
        outcomes.sort_by(|a, b| a.site.cmp(&b.site));

        let result = JobResult::new(run_id, SYNC_JOB, started_at, outcomes);
        self.persist_result(&result).await;
        info!("{}", result.summary_line());
        Ok(result)
    }

    async fn sync_site(&self, site: &str, window: DateWindow) -> SiteOutcome {
        let span = info_span!("site_sync", site);
        async {
            match self.try_sync_site(site, window).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "site sync failed");
                    SiteOutcome::failed(site, err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_sync_site(&self, site: &str, window: DateWindow) -> Result<SiteOutcome, SyncError> {
        let raw = extract_site(
            self.source.as_ref(),
            self.config.retry,
            Some(&self.pacer),
            site,
            window,
            self.config.page_size,
            self.config.max_rows_per_site,
        )
        .instrument(info_span!("extract"))
        .await?;
        let rows_fetched = raw.len();

        let (records, rows_skipped) = info_span!("transform").in_scope(|| {
            let mut records = Vec::with_capacity(raw.len());
            let mut skipped = 0usize;
            for row in &raw {
                match MetricRecord::from_row(site, row) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        skipped += 1;
                        debug!(error = %err, "skipping invalid upstream row");
                    }
                }
            }
            (records, skipped)
        });

        let rows_upserted = retry(SYNC_JOB, self.config.retry, || {
            self.warehouse.upsert_metrics(&records)
        })
        .instrument(info_span!("upsert", rows = records.len()))
        .await?;

        Ok(SiteOutcome {
            site: site.to_string(),
            rows_fetched,
            rows_upserted,
            rows_skipped,
            error: None,
        })
    }

    /// Create pending snapshots for each site's top pages by clicks over the
    /// trailing traffic window. Insert-if-absent keying makes same-day
    /// re-runs no-ops.
    pub async fn run_capture(&self, today: NaiveDate) -> Result<JobResult, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let since = today - Days::new(self.config.traffic_window_days.saturating_sub(1));
        info!(job = CAPTURE_JOB, run = %run_id, %today, %since, "starting snapshot capture");

        let mut outcomes = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            let outcome = match self.capture_site(site, since, today).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(site, error = %err, "snapshot capture failed for site");
                    SiteOutcome::failed(site, err.to_string())
                }
            };
            outcomes.push(outcome);
        }

        let result = JobResult::new(run_id, CAPTURE_JOB, started_at, outcomes);
        self.persist_result(&result).await;
        info!("{}", result.summary_line());
        Ok(result)
    }

    async fn capture_site(
        &self,
        site: &str,
        since: NaiveDate,
        today: NaiveDate,
    ) -> Result<SiteOutcome, SyncError> {
        let pages = self
            .warehouse
            .top_pages_by_clicks(site, since, self.config.snapshot_page_limit)
            .await?;
        let snapshots: Vec<SnapshotRecord> = pages
            .iter()
            .map(|page| SnapshotRecord::pending(site, page, today))
            .collect();
        let inserted = self.warehouse.insert_pending_snapshots(&snapshots).await?;
        debug!(
            site,
            candidates = snapshots.len(),
            inserted,
            "pending snapshots captured"
        );
        Ok(SiteOutcome {
            site: site.to_string(),
            rows_fetched: snapshots.len(),
            rows_upserted: inserted,
            rows_skipped: snapshots.len() - inserted,
            error: None,
        })
    }

    /// Sweep every pending snapshot whose reporting lag has passed, joining
    /// each against the metrics for its own capture date. Snapshots without
    /// a matching metric row stay pending for the next run; completion is
    /// never forced.
    pub async fn run_completion(&self, today: NaiveDate) -> Result<JobResult, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let cutoff = today - Days::new(REPORTING_LAG_DAYS);
        let pending = self.warehouse.pending_snapshots_through(cutoff).await?;
        info!(
            job = COMPLETION_JOB,
            run = %run_id,
            pending = pending.len(),
            %cutoff,
            "starting snapshot completion"
        );

        let mut by_site: BTreeMap<String, Vec<SnapshotRecord>> = BTreeMap::new();
        for snapshot in pending {
            by_site
                .entry(snapshot.site.clone())
                .or_default()
                .push(snapshot);
        }

        let mut outcomes = Vec::with_capacity(by_site.len());
        for (site, snapshots) in &by_site {
            let outcome = match self.complete_site(site, snapshots).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(site, error = %err, "snapshot completion failed for site");
                    SiteOutcome::failed(site, err.to_string())
                }
            };
            outcomes.push(outcome);
        }

        let result = JobResult::new(run_id, COMPLETION_JOB, started_at, outcomes);
        self.persist_result(&result).await;
        info!("{}", result.summary_line());
        Ok(result)
    }

    async fn complete_site(
        &self,
        site: &str,
        snapshots: &[SnapshotRecord],
    ) -> Result<SiteOutcome, SyncError> {
        let mut completed = 0usize;
        let mut left_pending = 0usize;
        for snapshot in snapshots {
            match self
                .warehouse
                .metrics_for_page(site, &snapshot.page, snapshot.captured_on)
                .await?
            {
                Some(perf) => {
                    if self.warehouse.complete_snapshot(snapshot.id, &perf).await? {
                        completed += 1;
                    } else {
                        left_pending += 1;
                    }
                }
                None => {
                    left_pending += 1;
                    debug!(
                        site,
                        page = %snapshot.page,
                        captured_on = %snapshot.captured_on,
                        "no metrics for capture date yet; leaving pending"
                    );
                }
            }
        }
        Ok(SiteOutcome {
            site: site.to_string(),
            rows_fetched: snapshots.len(),
            rows_upserted: completed,
            rows_skipped: left_pending,
            error: None,
        })
    }

    /// Verify the snapshot cadence: a capture exists for today and for
    /// yesterday, and nothing is pending past the staleness threshold. Reads
    /// only; violations are returned, not raised.
    pub async fn run_health_check(&self, today: NaiveDate) -> Result<HealthReport, SyncError> {
        let yesterday = today - Days::new(1);
        let mut violations = Vec::new();

        if self.warehouse.snapshot_count_on(today).await? == 0 {
            violations.push(StalenessViolation::NoSnapshotToday { date: today });
        }
        if self.warehouse.snapshot_count_on(yesterday).await? == 0 {
            violations.push(StalenessViolation::NoSnapshotYesterday { date: yesterday });
        }
        let cutoff = today - Days::new(STALE_PENDING_DAYS);
        let stale = self.warehouse.stale_pending_count(cutoff).await?;
        if stale > 0 {
            violations.push(StalenessViolation::StalePending {
                count: stale,
                cutoff,
            });
        }

        for violation in &violations {
            warn!(%today, "health violation: {violation}");
        }
        Ok(HealthReport {
            checked_on: today,
            violations,
        })
    }

    /// The daily dependency chain: sync, capture, completion, health check,
    /// strictly in that order. A failed step is logged and the chain
    /// continues; the snapshot steps operate on previously synced data.
    pub async fn run_daily_chain(&self) {
        let today = Utc::now().date_naive();
        let window = self.sync_window(self.config.sync_window_days);
        info!(%today, "running daily job chain");

        match self.run_sync(window).await {
            Ok(result) => {
                info!(job = SYNC_JOB, status = result.status.as_str(), "chain step finished");
            }
            Err(err) => warn!(job = SYNC_JOB, error = %err, "chain step failed"),
        }
        match self.run_capture(today).await {
            Ok(result) => {
                info!(job = CAPTURE_JOB, status = result.status.as_str(), "chain step finished");
            }
            Err(err) => warn!(job = CAPTURE_JOB, error = %err, "chain step failed"),
        }
        match self.run_completion(today).await {
            Ok(result) => {
                info!(job = COMPLETION_JOB, status = result.status.as_str(), "chain step finished");
            }
            Err(err) => warn!(job = COMPLETION_JOB, error = %err, "chain step failed"),
        }
        match self.run_health_check(today).await {
            Ok(report) if report.healthy() => info!("health check passed"),
            Ok(report) => {
                warn!(violations = report.violations.len(), "health check found violations");
            }
            Err(err) => warn!(error = %err, "health check failed"),
        }
    }

    async fn persist_result(&self, result: &JobResult) {
        if let Err(err) = self.warehouse.insert_job_result(result).await {
            warn!(
                job = %result.job,
                run = %result.run_id,
                error = %err,
                "failed to persist job audit row"
            );
        }
    }
}

/// Register the daily chain on a cron scheduler. The chain runs as one
/// sequential job, so its steps never reorder or overlap.
pub async fn build_scheduler(engine: Arc<SyncEngine>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let engine = engine.clone();
        Box::pin(async move {
            engine.run_daily_chain().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Scheduler construction honoring the `scheduler_enabled` flag.
pub async fn maybe_build_scheduler(engine: Arc<SyncEngine>) -> Result<Option<JobScheduler>> {
    if !engine.config.scheduler_enabled {
        return Ok(None);
    }
    let cron = engine.config.daily_cron.clone();
    Ok(Some(build_scheduler(engine, &cron).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use spire_core::{ApiRow, JobStatus, PagePerformance, PageType, SnapshotStatus};
    use spire_store::{MemoryWarehouse, UpstreamErrorKind};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn at(y: i32, m: u32, day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, h, 0, 0).single().unwrap()
    }

    fn mk_row(date: &str, page: &str, query: &str, clicks: f64) -> ApiRow {
        ApiRow {
            keys: vec![date.to_string(), page.to_string(), query.to_string()],
            clicks,
            impressions: clicks * 20.0,
            ctr: 0.05,
            position: 4.0,
        }
    }

    fn mk_metric(date: NaiveDate, site: &str, page: &str, query: &str, clicks: i64) -> MetricRecord {
        MetricRecord {
            date,
            site: site.to_string(),
            page: page.to_string(),
            query: query.to_string(),
            clicks,
            impressions: clicks * 20,
            ctr: 0.05,
            position: 4.0,
        }
    }

    fn mk_link(source: &str, target: &str) -> BrokenLink {
        BrokenLink {
            source: source.to_string(),
            target: target.to_string(),
            status_code: Some(404),
            anchor_text: None,
        }
    }

    fn mk_scan(site: &str, scanned_at: DateTime<Utc>, links: Vec<BrokenLink>) -> ScanRecord {
        ScanRecord {
            scan_id: Uuid::new_v4(),
            site: site.to_string(),
            scanned_at,
            pages_crawled: 100,
            broken_url_count: links.len() as u64,
            broken_links: links,
        }
    }

    #[derive(Default)]
    struct StaticSource {
        rows: HashMap<String, Result<Vec<ApiRow>, String>>,
        hang: HashSet<String>,
    }

    impl StaticSource {
        fn with_rows(site: &str, rows: Vec<ApiRow>) -> Self {
            Self::default().insert(site, Ok(rows))
        }

        fn insert(mut self, site: &str, rows: Result<Vec<ApiRow>, String>) -> Self {
            self.rows.insert(site.to_string(), rows);
            self
        }

        fn hanging(mut self, site: &str) -> Self {
            self.hang.insert(site.to_string());
            self
        }
    }

    #[async_trait]
    impl PerformanceSource for StaticSource {
        async fn fetch_page(
            &self,
            site: &str,
            _window: DateWindow,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiRow>, SyncError> {
            if self.hang.contains(site) {
                futures::future::pending::<()>().await;
            }
            match self.rows.get(site) {
                Some(Ok(rows)) => {
                    if offset >= rows.len() {
                        return Ok(Vec::new());
                    }
                    let end = (offset + limit).min(rows.len());
                    Ok(rows[offset..end].to_vec())
                }
                Some(Err(message)) => Err(SyncError::Upstream {
                    site: site.to_string(),
                    kind: UpstreamErrorKind::Transient,
                    message: message.clone(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            database_url: "postgres://localhost/spire".to_string(),
            upstream_base: "https://reporting.example.com/v3".to_string(),
            upstream_token: "token".to_string(),
            user_agent: "spire-test".to_string(),
            sites_file: PathBuf::from("./sites.yaml"),
            scan_root: PathBuf::from("./scans"),
            schema: "seo".to_string(),
            page_size: 100,
            max_rows_per_site: 1_000,
            upsert_chunk_size: 500,
            max_concurrent_sites: 4,
            sync_window_days: 3,
            traffic_window_days: 28,
            snapshot_page_limit: 10,
            request_interval: Duration::ZERO,
            http_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(60),
            retry: quick_policy(),
            scheduler_enabled: false,
            daily_cron: "0 0 6 * * *".to_string(),
        }
    }

    fn mk_engine(
        warehouse: &Arc<MemoryWarehouse>,
        source: StaticSource,
        sites: &[&str],
    ) -> SyncEngine {
        SyncEngine::new(
            test_config(),
            sites.iter().map(|s| s.to_string()).collect(),
            warehouse.clone(),
            Arc::new(source),
        )
    }

    fn window() -> DateWindow {
        DateWindow::trailing(d(2026, 8, 24), 3)
    }

    const SITE_A: &str = "https://a.example.com/";
    const SITE_B: &str = "https://b.example.com/";

    #[tokio::test]
    async fn rerun_with_identical_upstream_data_is_idempotent() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let rows = vec![
            mk_row("2026-08-22", "https://a.example.com/p1", "widgets", 4.0),
            mk_row("2026-08-23", "https://a.example.com/p1", "widgets", 6.0),
            mk_row("2026-08-23", "https://a.example.com/p2", "gadgets", 2.0),
        ];
        let engine = mk_engine(&warehouse, StaticSource::with_rows(SITE_A, rows), &[SITE_A]);

        let first = engine.run_sync(window()).await.unwrap();
        assert_eq!(first.status, JobStatus::Success);
        let after_first = warehouse.metrics_sorted().await;

        let second = engine.run_sync(window()).await.unwrap();
        assert_eq!(second.status, JobStatus::Success);
        let after_second = warehouse.metrics_sorted().await;

        assert_eq!(after_first.len(), 3);
        assert_eq!(after_first, after_second);
        assert_eq!(second.rows_upserted(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_site_yields_partial_with_other_rows_kept() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = StaticSource::with_rows(
            SITE_A,
            vec![
                mk_row("2026-08-23", "https://a.example.com/p1", "widgets", 4.0),
                mk_row("2026-08-23", "https://a.example.com/p2", "widgets", 1.0),
            ],
        )
        .insert(SITE_B, Err("upstream 500".to_string()));
        let engine = mk_engine(&warehouse, source, &[SITE_A, SITE_B]);

        let result = engine.run_sync(window()).await.unwrap();

        assert_eq!(result.status, JobStatus::Partial);
        assert_eq!(result.failed_sites(), vec![SITE_B]);
        assert_eq!(warehouse.metric_count().await, 2);
        let failed = result.outcomes.iter().find(|o| o.site == SITE_B).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("upstream 500"));
    }

    #[tokio::test]
    async fn invalid_rows_are_skipped_and_counted() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let bad_date = mk_row("08/23/2026", "https://a.example.com/p9", "widgets", 1.0);
        let mut negative = mk_row("2026-08-23", "https://a.example.com/p8", "widgets", 1.0);
        negative.clicks = -3.0;
        let rows = vec![
            mk_row("2026-08-23", "https://a.example.com/p1", "widgets", 4.0),
            bad_date,
            mk_row("2026-08-23", "https://a.example.com/p2", "widgets", 2.0),
            negative,
            mk_row("2026-08-23", "https://a.example.com/p3", "widgets", 3.0),
        ];
        let engine = mk_engine(&warehouse, StaticSource::with_rows(SITE_A, rows), &[SITE_A]);

        let result = engine.run_sync(window()).await.unwrap();

        assert_eq!(result.status, JobStatus::Success);
        let outcome = &result.outcomes[0];
        assert_eq!(outcome.rows_fetched, 5);
        assert_eq!(outcome.rows_upserted, 3);
        assert_eq!(outcome.rows_skipped, 2);
        assert_eq!(warehouse.metric_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_keeps_finished_outcomes_and_fails_the_rest() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = StaticSource::with_rows(
            SITE_A,
            vec![mk_row("2026-08-23", "https://a.example.com/p1", "widgets", 4.0)],
        )
        .hanging(SITE_B);
        let mut config = test_config();
        config.run_timeout = Duration::from_secs(5);
        let engine = SyncEngine::new(
            config,
            vec![SITE_A.to_string(), SITE_B.to_string()],
            warehouse.clone(),
            Arc::new(source),
        );

        let result = engine.run_sync(window()).await.unwrap();

        assert_eq!(result.status, JobStatus::Partial);
        assert_eq!(warehouse.metric_count().await, 1);
        let timed_out = result.outcomes.iter().find(|o| o.site == SITE_B).unwrap();
        assert!(timed_out.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(warehouse.job_results().await.len(), 1);
    }

    #[tokio::test]
    async fn capture_snapshots_top_pages_within_traffic_window() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let today = d(2026, 8, 26);
        warehouse
            .upsert_metrics(&[
                mk_metric(
                    d(2026, 8, 20),
                    SITE_A,
                    "https://a.example.com/products/anvil",
                    "widgets",
                    10,
                ),
                mk_metric(d(2026, 6, 1), SITE_A, "https://a.example.com/old", "widgets", 500),
            ])
            .await
            .unwrap();
        let engine = mk_engine(&warehouse, StaticSource::default(), &[SITE_A]);

        let result = engine.run_capture(today).await.unwrap();

        assert_eq!(result.status, JobStatus::Success);
        let snapshots = warehouse.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.page, "https://a.example.com/products/anvil");
        assert_eq!(snap.captured_on, today);
        assert_eq!(snap.status, SnapshotStatus::Pending);
        assert_eq!(snap.page_type, PageType::Product);
    }

    #[tokio::test]
    async fn capture_rerun_same_day_neither_duplicates_nor_reverts() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let today = d(2026, 8, 26);
        let page = "https://a.example.com/products/anvil";
        warehouse
            .upsert_metrics(&[mk_metric(d(2026, 8, 24), SITE_A, page, "widgets", 7)])
            .await
            .unwrap();
        let engine = mk_engine(&warehouse, StaticSource::default(), &[SITE_A]);

        engine.run_capture(today).await.unwrap();
        let first = warehouse.snapshots().await;
        assert_eq!(first.len(), 1);

        let perf = PagePerformance {
            clicks: 7,
            impressions: 140,
            ctr: 0.05,
            position: 4.0,
        };
        assert!(warehouse.complete_snapshot(first[0].id, &perf).await.unwrap());

        let second_result = engine.run_capture(today).await.unwrap();
        let second = warehouse.snapshots().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].status, SnapshotStatus::Complete);
        let outcome = &second_result.outcomes[0];
        assert_eq!(outcome.rows_upserted, 0);
        assert_eq!(outcome.rows_skipped, 1);
    }

    #[tokio::test]
    async fn completion_joins_exact_match_and_leaves_rest_pending() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let today = d(2026, 8, 26);

        warehouse
            .upsert_metrics(&[
                mk_metric(d(2026, 8, 24), SITE_A, "https://a.example.com/p1", "widgets", 5),
                mk_metric(d(2026, 8, 24), SITE_A, "https://a.example.com/p1", "gadgets", 3),
                mk_metric(d(2026, 8, 22), SITE_A, "https://a.example.com/p3", "widgets", 2),
            ])
            .await
            .unwrap();
        warehouse
            .insert_pending_snapshots(&[
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p1", d(2026, 8, 24)),
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p2", d(2026, 8, 24)),
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p3", d(2026, 8, 22)),
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p4", d(2026, 8, 25)),
            ])
            .await
            .unwrap();
        let engine = mk_engine(&warehouse, StaticSource::default(), &[SITE_A]);

        let result = engine.run_completion(today).await.unwrap();

        assert_eq!(result.status, JobStatus::Success);
        let snapshots = warehouse.snapshots().await;
        let by_page = |suffix: &str| {
            snapshots
                .iter()
                .find(|s| s.page.ends_with(suffix))
                .unwrap()
                .clone()
        };
        let p1 = by_page("/p1");
        assert_eq!(p1.status, SnapshotStatus::Complete);
        assert_eq!(p1.clicks, Some(8));
        assert_eq!(p1.impressions, Some(160));
        let p2 = by_page("/p2");
        assert_eq!(p2.status, SnapshotStatus::Pending);
        assert!(p2.clicks.is_none());
        assert_eq!(by_page("/p3").status, SnapshotStatus::Complete);
        assert_eq!(by_page("/p4").status, SnapshotStatus::Pending);
        let outcome = &result.outcomes[0];
        assert_eq!(outcome.rows_fetched, 3);
        assert_eq!(outcome.rows_upserted, 2);
        assert_eq!(outcome.rows_skipped, 1);
    }

    #[tokio::test]
    async fn health_check_flags_cadence_and_staleness_independently() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let today = d(2026, 8, 26);
        let engine = mk_engine(&warehouse, StaticSource::default(), &[SITE_A]);

        let report = engine.run_health_check(today).await.unwrap();
        assert_eq!(report.violations.len(), 2);
        assert!(report
            .violations
            .contains(&StalenessViolation::NoSnapshotToday { date: today }));
        assert!(report
            .violations
            .contains(&StalenessViolation::NoSnapshotYesterday { date: d(2026, 8, 25) }));

        warehouse
            .insert_pending_snapshots(&[
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p1", today),
                SnapshotRecord::pending(SITE_A, "https://a.example.com/p1", d(2026, 8, 25)),
            ])
            .await
            .unwrap();
        let report = engine.run_health_check(today).await.unwrap();
        assert!(report.healthy());

        warehouse
            .insert_pending_snapshots(&[SnapshotRecord::pending(
                SITE_A,
                "https://a.example.com/p2",
                d(2026, 8, 23),
            )])
            .await
            .unwrap();
        let report = engine.run_health_check(today).await.unwrap();
        assert_eq!(
            report.violations,
            vec![StalenessViolation::StalePending {
                count: 1,
                cutoff: d(2026, 8, 23),
            }]
        );
    }

    #[tokio::test]
    async fn daily_chain_persists_each_job_in_order() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let engine = mk_engine(
            &warehouse,
            StaticSource::with_rows(SITE_A, Vec::new()),
            &[SITE_A],
        );

        engine.run_daily_chain().await;

        let jobs: Vec<String> = warehouse
            .job_results()
            .await
            .iter()
            .map(|r| r.job.clone())
            .collect();
        assert_eq!(jobs, vec![SYNC_JOB, CAPTURE_JOB, COMPLETION_JOB]);
    }

    #[test]
    fn delta_classifies_added_removed_unchanged() {
        let l1 = mk_link("https://a.example.com/p1", "https://gone.example.com/x");
        let l2 = mk_link("https://a.example.com/p2", "https://gone.example.com/y");
        let l3 = mk_link("https://a.example.com/p3", "https://gone.example.com/z");
        let from = mk_scan(SITE_A, at(2026, 8, 24, 3), vec![l1.clone(), l2.clone()]);
        let to = mk_scan(SITE_A, at(2026, 8, 25, 3), vec![l2.clone(), l3.clone()]);

        let delta = delta_between(&from, &to);

        assert_eq!(delta.added, vec![l3]);
        assert_eq!(delta.removed, vec![l1]);
        assert_eq!(delta.unchanged, vec![l2]);
        assert_eq!(delta.from_scan, from.scan_id);
        assert_eq!(delta.to_scan, to.scan_id);
    }

    #[test]
    fn delta_trusts_detail_lists_over_coarse_counters() {
        let l1 = mk_link("https://a.example.com/p1", "https://gone.example.com/x");
        let mut from = mk_scan(SITE_A, at(2026, 8, 24, 3), vec![l1.clone()]);
        from.broken_url_count = 40;
        let mut to = mk_scan(SITE_A, at(2026, 8, 25, 3), vec![l1.clone()]);
        to.broken_url_count = 7;

        let delta = delta_between(&from, &to);

        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
        assert_eq!(delta.unchanged, vec![l1]);
    }

    #[test]
    fn delta_output_is_sorted_and_deduplicated() {
        let links = vec![
            mk_link("https://a.example.com/p9", "https://gone.example.com/z"),
            mk_link("https://a.example.com/p1", "https://gone.example.com/a"),
            mk_link("https://a.example.com/p1", "https://gone.example.com/a"),
            mk_link("https://a.example.com/p5", "https://gone.example.com/m"),
        ];
        let from = mk_scan(SITE_A, at(2026, 8, 24, 3), Vec::new());
        let to = mk_scan(SITE_A, at(2026, 8, 25, 3), links);

        let delta = delta_between(&from, &to);

        let identities: Vec<(&str, &str)> = delta.added.iter().map(BrokenLink::identity).collect();
        assert_eq!(
            identities,
            vec![
                ("https://a.example.com/p1", "https://gone.example.com/a"),
                ("https://a.example.com/p5", "https://gone.example.com/m"),
                ("https://a.example.com/p9", "https://gone.example.com/z"),
            ]
        );
    }

    #[tokio::test]
    async fn reconstruct_delta_needs_two_scans() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanStore::new(dir.path());

        let outcome = reconstruct_delta(&store, SITE_A).await.unwrap();
        assert_eq!(outcome, DeltaOutcome::Unavailable { scans_found: 0 });

        let l1 = mk_link("https://a.example.com/p1", "https://gone.example.com/x");
        let l2 = mk_link("https://a.example.com/p2", "https://gone.example.com/y");
        let l3 = mk_link("https://a.example.com/p3", "https://gone.example.com/z");
        store
            .append(&mk_scan(SITE_A, at(2026, 8, 24, 3), vec![l1.clone(), l2.clone()]))
            .await
            .unwrap();

        let outcome = reconstruct_delta(&store, SITE_A).await.unwrap();
        assert_eq!(outcome, DeltaOutcome::Unavailable { scans_found: 1 });

        store
            .append(&mk_scan(SITE_A, at(2026, 8, 25, 3), vec![l2.clone(), l3.clone()]))
            .await
            .unwrap();

        match reconstruct_delta(&store, SITE_A).await.unwrap() {
            DeltaOutcome::Computed(delta) => {
                assert_eq!(delta.added, vec![l3]);
                assert_eq!(delta.removed, vec![l1]);
                assert_eq!(delta.unchanged, vec![l2]);
            }
            other => panic!("expected computed delta, got {other:?}"),
        }
    }

    #[test]
    fn config_requires_database_url_and_token() {
        let err = EngineConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("SPIRE_DATABASE_URL"));

        let only_db = |key: &str| {
            (key == "SPIRE_DATABASE_URL").then(|| "postgres://localhost/spire".to_string())
        };
        let err = EngineConfig::from_lookup(only_db).unwrap_err();
        assert!(err.to_string().contains("SPIRE_UPSTREAM_TOKEN"));
    }

    #[test]
    fn config_defaults_fill_optional_settings() {
        let minimal = |key: &str| match key {
            "SPIRE_DATABASE_URL" => Some("postgres://localhost/spire".to_string()),
            "SPIRE_UPSTREAM_TOKEN" => Some("token".to_string()),
            _ => None,
        };
        let config = EngineConfig::from_lookup(minimal).unwrap();

        assert_eq!(config.schema, "seo");
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.max_concurrent_sites, 4);
        assert_eq!(config.sync_window_days, 3);
        assert_eq!(config.traffic_window_days, 28);
        assert_eq!(config.scan_root, PathBuf::from("./scans"));
        assert_eq!(config.sites_file, PathBuf::from("./sites.yaml"));
        assert!(!config.scheduler_enabled);
    }

    #[tokio::test]
    async fn registry_filters_disabled_sites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.yaml");
        tokio::fs::write(
            &path,
            "sites:\n  - site_url: https://a.example.com/\n    enabled: true\n  - site_url: https://b.example.com/\n    enabled: false\n",
        )
        .await
        .unwrap();

        let registry = SiteRegistry::load(&path).await.unwrap();

        assert_eq!(registry.sites.len(), 2);
        assert_eq!(registry.enabled_sites(), vec!["https://a.example.com/".to_string()]);
    }
}
