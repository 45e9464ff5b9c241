//! Core domain model and job-outcome types for SPIRE.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spire-core";

/// Days between a capture date and the first date its performance rows can
/// exist upstream.
pub const REPORTING_LAG_DAYS: u64 = 2;

/// Days after which a still-pending snapshot counts as stale.
pub const STALE_PENDING_DAYS: u64 = 3;

/// Raw reporting-API row as returned by the upstream, before validation.
///
/// `keys` carries the requested dimensions in order: date, page, query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRow {
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

/// Why an upstream row was rejected at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowValidationError {
    #[error("row has {0} key dimensions, expected 3 (date, page, query)")]
    KeyArity(usize),
    #[error("unparseable date dimension '{0}'")]
    BadDate(String),
    #[error("empty {0} dimension")]
    EmptyDimension(&'static str),
    #[error("invalid {0} value")]
    InvalidValue(&'static str),
}

/// Composite natural key of a [`MetricRecord`].
pub type MetricKey = (NaiveDate, String, String, String);

/// One (date, site, page, query) performance observation.
///
/// Re-ingesting the same key overwrites the prior values in full; metrics
/// are never accumulated across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub date: NaiveDate,
    pub site: String,
    pub page: String,
    pub query: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

impl MetricRecord {
    /// Validate one upstream row into a typed record. Rows missing key
    /// dimensions, carrying unparseable dates, or carrying negative or
    /// non-finite measures are rejected rather than stored.
    pub fn from_row(site: &str, row: &ApiRow) -> Result<Self, RowValidationError> {
        if row.keys.len() != 3 {
            return Err(RowValidationError::KeyArity(row.keys.len()));
        }
        let date = NaiveDate::parse_from_str(row.keys[0].trim(), "%Y-%m-%d")
            .map_err(|_| RowValidationError::BadDate(row.keys[0].clone()))?;
        let page = row.keys[1].trim();
        if page.is_empty() {
            return Err(RowValidationError::EmptyDimension("page"));
        }
        let query = row.keys[2].trim();
        if query.is_empty() {
            return Err(RowValidationError::EmptyDimension("query"));
        }
        let clicks = non_negative_count(row.clicks, "clicks")?;
        let impressions = non_negative_count(row.impressions, "impressions")?;
        if !row.ctr.is_finite() || row.ctr < 0.0 {
            return Err(RowValidationError::InvalidValue("ctr"));
        }
        if !row.position.is_finite() || row.position < 0.0 {
            return Err(RowValidationError::InvalidValue("position"));
        }
        Ok(Self {
            date,
            site: site.to_string(),
            page: page.to_string(),
            query: query.to_string(),
            clicks,
            impressions,
            ctr: row.ctr,
            position: row.position,
        })
    }

    pub fn key(&self) -> MetricKey {
        (
            self.date,
            self.site.clone(),
            self.page.clone(),
            self.query.clone(),
        )
    }
}

fn non_negative_count(value: f64, field: &'static str) -> Result<i64, RowValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RowValidationError::InvalidValue(field));
    }
    Ok(value.round() as i64)
}

/// Page-level performance for one date, aggregated across queries.
///
/// `position` is impression-weighted; `ctr` is recomputed from the summed
/// counts rather than averaged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PagePerformance {
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

impl PagePerformance {
    /// Aggregate per-query rows for one page and date. `None` when the
    /// iterator is empty, so callers can tell "no data" from "zero clicks".
    pub fn aggregate<'a>(rows: impl IntoIterator<Item = &'a MetricRecord>) -> Option<Self> {
        let mut clicks = 0i64;
        let mut impressions = 0i64;
        let mut weighted_position = 0.0f64;
        let mut position_sum = 0.0f64;
        let mut row_count = 0usize;
        for row in rows {
            clicks += row.clicks;
            impressions += row.impressions;
            weighted_position += row.position * row.impressions as f64;
            position_sum += row.position;
            row_count += 1;
        }
        if row_count == 0 {
            return None;
        }
        let ctr = if impressions > 0 {
            clicks as f64 / impressions as f64
        } else {
            0.0
        };
        let position = if impressions > 0 {
            weighted_position / impressions as f64
        } else {
            position_sum / row_count as f64
        };
        Some(Self {
            clicks,
            impressions,
            ctr,
            position,
        })
    }
}

/// Page classification inferred from URL shape alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Home,
    Product,
    Category,
    Article,
    Search,
    Other,
}

impl PageType {
    pub fn as_str(self) -> &'static str {
        match self {
            PageType::Home => "home",
            PageType::Product => "product",
            PageType::Category => "category",
            PageType::Article => "article",
            PageType::Search => "search",
            PageType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "home" => Some(PageType::Home),
            "product" => Some(PageType::Product),
            "category" => Some(PageType::Category),
            "article" => Some(PageType::Article),
            "search" => Some(PageType::Search),
            "other" => Some(PageType::Other),
            _ => None,
        }
    }
}

/// Classify a page URL by its path shape. Unparseable URLs fall through to
/// [`PageType::Other`].
pub fn classify_page(page_url: &str) -> PageType {
    let Ok(parsed) = Url::parse(page_url) else {
        return PageType::Other;
    };
    if parsed.query_pairs().any(|(k, _)| k == "q" || k == "s") {
        return PageType::Search;
    }
    let path = parsed.path().trim_matches('/').to_ascii_lowercase();
    if path.is_empty() {
        return PageType::Home;
    }
    let first = path.split('/').next().unwrap_or_default();
    match first {
        "search" => PageType::Search,
        "product" | "products" | "shop" | "store" | "p" => PageType::Product,
        "category" | "categories" | "collections" | "c" | "tag" => PageType::Category,
        "blog" | "news" | "article" | "articles" | "post" | "posts" | "guides" => PageType::Article,
        _ => PageType::Other,
    }
}

/// Description-template family matched to a page at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionTemplate {
    Landing,
    Commerce,
    Listing,
    Editorial,
    Utility,
}

impl DescriptionTemplate {
    pub fn for_page_type(page_type: PageType) -> Self {
        match page_type {
            PageType::Home => DescriptionTemplate::Landing,
            PageType::Product => DescriptionTemplate::Commerce,
            PageType::Category => DescriptionTemplate::Listing,
            PageType::Article => DescriptionTemplate::Editorial,
            PageType::Search | PageType::Other => DescriptionTemplate::Utility,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DescriptionTemplate::Landing => "landing",
            DescriptionTemplate::Commerce => "commerce",
            DescriptionTemplate::Listing => "listing",
            DescriptionTemplate::Editorial => "editorial",
            DescriptionTemplate::Utility => "utility",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "landing" => Some(DescriptionTemplate::Landing),
            "commerce" => Some(DescriptionTemplate::Commerce),
            "listing" => Some(DescriptionTemplate::Listing),
            "editorial" => Some(DescriptionTemplate::Editorial),
            "utility" => Some(DescriptionTemplate::Utility),
            _ => None,
        }
    }

    /// Fill-in skeleton for the template family.
    pub fn pattern(self) -> &'static str {
        match self {
            DescriptionTemplate::Landing => "{brand}: {value_proposition}",
            DescriptionTemplate::Commerce => "Shop {item} at {brand}. {offer}",
            DescriptionTemplate::Listing => "Browse {category} picks from {brand}.",
            DescriptionTemplate::Editorial => "{summary} Read more on {brand}.",
            DescriptionTemplate::Utility => "{page_title} | {brand}",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Complete,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SnapshotStatus::Pending),
            "complete" => Some(SnapshotStatus::Complete),
            _ => None,
        }
    }
}

/// Point-in-time metadata for a page, enriched with performance data once
/// the upstream reporting lag has passed.
///
/// A snapshot moves pending → complete at most once and never reverses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub site: String,
    pub page: String,
    pub captured_on: NaiveDate,
    pub page_type: PageType,
    pub template: DescriptionTemplate,
    pub status: SnapshotStatus,
    pub impressions: Option<i64>,
    pub clicks: Option<i64>,
    pub ctr: Option<f64>,
    pub position: Option<f64>,
}

impl SnapshotRecord {
    /// New pending snapshot with page type and template classified from the
    /// URL. Performance fields stay empty until completion.
    pub fn pending(site: &str, page: &str, captured_on: NaiveDate) -> Self {
        let page_type = classify_page(page);
        Self {
            id: Uuid::new_v4(),
            site: site.to_string(),
            page: page.to_string(),
            captured_on,
            page_type,
            template: DescriptionTemplate::for_page_type(page_type),
            status: SnapshotStatus::Pending,
            impressions: None,
            clicks: None,
            ctr: None,
            position: None,
        }
    }

    /// Whether the upstream lag has passed and completion may be attempted.
    pub fn is_due_for_completion(&self, today: NaiveDate) -> bool {
        self.status == SnapshotStatus::Pending
            && self.captured_on <= today - Days::new(REPORTING_LAG_DAYS)
    }

    /// Whether this snapshot has been pending past the staleness threshold.
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.status == SnapshotStatus::Pending
            && self.captured_on <= today - Days::new(STALE_PENDING_DAYS)
    }
}

/// One detected broken link. Identity is the (source, target) pair; status
/// code and anchor text are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub anchor_text: Option<String>,
}

impl BrokenLink {
    pub fn identity(&self) -> (&str, &str) {
        (&self.source, &self.target)
    }
}

/// One run of a detection sweep for a site. Append-only: never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: Uuid,
    pub site: String,
    pub scanned_at: DateTime<Utc>,
    pub pages_crawled: u64,
    /// Coarse distinct-URL counter reported by the scanner; the
    /// `broken_links` detail list is authoritative when the two diverge.
    pub broken_url_count: u64,
    pub broken_links: Vec<BrokenLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    /// Failed when no site succeeded, partial when some did, success
    /// otherwise. An empty run has nothing to fail and counts as success.
    pub fn from_outcomes(outcomes: &[SiteOutcome]) -> Self {
        if outcomes.is_empty() {
            return JobStatus::Success;
        }
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        if succeeded == 0 {
            JobStatus::Failed
        } else if succeeded < outcomes.len() {
            JobStatus::Partial
        } else {
            JobStatus::Success
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    /// Process exit code for job-result signaling: success 0, failed 1,
    /// partial 2 so alerting can tell the two failure shapes apart.
    pub fn exit_code(self) -> i32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::Failed => 1,
            JobStatus::Partial => 2,
        }
    }
}

/// Per-site detail inside a [`JobResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteOutcome {
    pub site: String,
    pub rows_fetched: usize,
    pub rows_upserted: usize,
    pub rows_skipped: usize,
    pub error: Option<String>,
}

impl SiteOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(site: &str, error: impl Into<String>) -> Self {
        Self {
            site: site.to_string(),
            rows_fetched: 0,
            rows_upserted: 0,
            rows_skipped: 0,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one job invocation. Created once, persisted for audit, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub run_id: Uuid,
    pub job: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcomes: Vec<SiteOutcome>,
}

impl JobResult {
    pub fn new(
        run_id: Uuid,
        job: &str,
        started_at: DateTime<Utc>,
        outcomes: Vec<SiteOutcome>,
    ) -> Self {
        let status = JobStatus::from_outcomes(&outcomes);
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id,
            job: job.to_string(),
            status,
            started_at,
            duration_ms,
            outcomes,
        }
    }

    pub fn rows_upserted(&self) -> usize {
        self.outcomes.iter().map(|o| o.rows_upserted).sum()
    }

    pub fn rows_skipped(&self) -> usize {
        self.outcomes.iter().map(|o| o.rows_skipped).sum()
    }

    pub fn failed_sites(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.site.as_str())
            .collect()
    }

    pub fn summary_line(&self) -> String {
        let succeeded = self.outcomes.iter().filter(|o| o.succeeded()).count();
        format!(
            "{} run {}: {} ({}/{} sites, {} rows upserted, {} skipped) in {}ms",
            self.job,
            self.run_id,
            self.status.as_str(),
            succeeded,
            self.outcomes.len(),
            self.rows_upserted(),
            self.rows_skipped(),
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_row(date: &str, page: &str, query: &str) -> ApiRow {
        ApiRow {
            keys: vec![date.to_string(), page.to_string(), query.to_string()],
            clicks: 12.0,
            impressions: 340.0,
            ctr: 0.035,
            position: 4.2,
        }
    }

    #[test]
    fn valid_row_maps_to_record() {
        let row = mk_row("2026-08-20", "https://example.com/blog/post", "rust etl");
        let record = MetricRecord::from_row("https://example.com/", &row).expect("valid row");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2026, 8, 20).unwrap());
        assert_eq!(record.clicks, 12);
        assert_eq!(record.impressions, 340);
        assert_eq!(record.query, "rust etl");
    }

    #[test]
    fn row_with_wrong_key_arity_is_rejected() {
        let mut row = mk_row("2026-08-20", "https://example.com/", "q");
        row.keys.pop();
        assert_eq!(
            MetricRecord::from_row("https://example.com/", &row),
            Err(RowValidationError::KeyArity(2))
        );
    }

    #[test]
    fn row_with_bad_date_is_rejected() {
        let row = mk_row("20-08-2026", "https://example.com/", "q");
        assert!(matches!(
            MetricRecord::from_row("https://example.com/", &row),
            Err(RowValidationError::BadDate(_))
        ));
    }

    #[test]
    fn row_with_empty_dimension_is_rejected() {
        let row = mk_row("2026-08-20", "  ", "q");
        assert_eq!(
            MetricRecord::from_row("https://example.com/", &row),
            Err(RowValidationError::EmptyDimension("page"))
        );
    }

    #[test]
    fn row_with_negative_count_is_rejected() {
        let mut row = mk_row("2026-08-20", "https://example.com/", "q");
        row.clicks = -1.0;
        assert_eq!(
            MetricRecord::from_row("https://example.com/", &row),
            Err(RowValidationError::InvalidValue("clicks"))
        );
    }

    #[test]
    fn page_classification_follows_path_shape() {
        assert_eq!(classify_page("https://example.com/"), PageType::Home);
        assert_eq!(
            classify_page("https://example.com/shop/widget-9"),
            PageType::Product
        );
        assert_eq!(
            classify_page("https://example.com/collections/sale"),
            PageType::Category
        );
        assert_eq!(
            classify_page("https://example.com/blog/2026/etl-notes"),
            PageType::Article
        );
        assert_eq!(
            classify_page("https://example.com/find?q=widgets"),
            PageType::Search
        );
        assert_eq!(classify_page("https://example.com/about"), PageType::Other);
        assert_eq!(classify_page("not a url"), PageType::Other);
    }

    #[test]
    fn page_performance_aggregates_weighted_by_impressions() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let base = MetricRecord {
            date,
            site: "https://example.com/".to_string(),
            page: "https://example.com/p".to_string(),
            query: "one".to_string(),
            clicks: 10,
            impressions: 100,
            ctr: 0.1,
            position: 2.0,
        };
        let mut other = base.clone();
        other.query = "two".to_string();
        other.clicks = 5;
        other.impressions = 300;
        other.position = 6.0;

        let perf = PagePerformance::aggregate([&base, &other]).expect("rows present");
        assert_eq!(perf.clicks, 15);
        assert_eq!(perf.impressions, 400);
        assert!((perf.ctr - 15.0 / 400.0).abs() < 1e-9);
        assert!((perf.position - 5.0).abs() < 1e-9);

        assert!(PagePerformance::aggregate(std::iter::empty::<&MetricRecord>()).is_none());
    }

    #[test]
    fn template_matches_page_type() {
        assert_eq!(
            DescriptionTemplate::for_page_type(PageType::Product),
            DescriptionTemplate::Commerce
        );
        assert_eq!(
            DescriptionTemplate::for_page_type(PageType::Other),
            DescriptionTemplate::Utility
        );
        assert!(DescriptionTemplate::Commerce.pattern().contains("{brand}"));
    }

    #[test]
    fn snapshot_due_and_stale_boundaries() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 26).unwrap();
        let mut snap = SnapshotRecord::pending(
            "https://example.com/",
            "https://example.com/blog/post",
            today - Days::new(2),
        );
        assert!(snap.is_due_for_completion(today));
        assert!(!snap.is_stale(today));

        snap.captured_on = today - Days::new(1);
        assert!(!snap.is_due_for_completion(today));

        snap.captured_on = today - Days::new(3);
        assert!(snap.is_stale(today));

        snap.status = SnapshotStatus::Complete;
        assert!(!snap.is_due_for_completion(today));
        assert!(!snap.is_stale(today));
    }

    fn mk_outcome(site: &str, failed: bool) -> SiteOutcome {
        if failed {
            SiteOutcome::failed(site, "boom")
        } else {
            SiteOutcome {
                site: site.to_string(),
                rows_fetched: 10,
                rows_upserted: 9,
                rows_skipped: 1,
                error: None,
            }
        }
    }

    #[test]
    fn job_status_distinguishes_three_outcomes() {
        assert_eq!(JobStatus::from_outcomes(&[]), JobStatus::Success);
        assert_eq!(
            JobStatus::from_outcomes(&[mk_outcome("a", false), mk_outcome("b", false)]),
            JobStatus::Success
        );
        assert_eq!(
            JobStatus::from_outcomes(&[mk_outcome("a", false), mk_outcome("b", true)]),
            JobStatus::Partial
        );
        assert_eq!(
            JobStatus::from_outcomes(&[mk_outcome("a", true), mk_outcome("b", true)]),
            JobStatus::Failed
        );
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_eq!(JobStatus::Success.exit_code(), 0);
        assert_eq!(JobStatus::Failed.exit_code(), 1);
        assert_eq!(JobStatus::Partial.exit_code(), 2);
    }

    #[test]
    fn job_result_aggregates_counts() {
        let result = JobResult::new(
            Uuid::new_v4(),
            "sync",
            Utc::now(),
            vec![mk_outcome("a", false), mk_outcome("b", true)],
        );
        assert_eq!(result.status, JobStatus::Partial);
        assert_eq!(result.rows_upserted(), 9);
        assert_eq!(result.rows_skipped(), 1);
        assert_eq!(result.failed_sites(), vec!["b"]);
        assert!(result.summary_line().contains("partial"));
    }
}
