//! Paginated client for the external search-performance reporting API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use spire_core::ApiRow;
use spire_store::{retry, RetryPolicy, SyncError, UpstreamErrorKind};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "spire-upstream";

/// Inclusive report-date range for one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::Configuration(format!(
                "date window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Window of `days` dates ending at `end` inclusive.
    pub fn trailing(end: NaiveDate, days: u64) -> Self {
        let days = days.max(1);
        Self {
            start: end - Days::new(days - 1),
            end,
        }
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Wire body for one reporting-API query page.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub row_limit: usize,
    pub start_row: usize,
}

/// Reporting-API response. The upstream omits `rows` entirely when a page
/// is empty, so it defaults rather than erroring.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub rows: Vec<ApiRow>,
}

/// One page of raw rows from the upstream for one site.
#[async_trait]
pub trait PerformanceSource: Send + Sync {
    async fn fetch_page(
        &self,
        site: &str,
        window: DateWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiRow>, SyncError>;
}

pub fn classify_status(status: StatusCode) -> UpstreamErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamErrorKind::Auth,
        StatusCode::NOT_FOUND => UpstreamErrorKind::NotFound,
        StatusCode::TOO_MANY_REQUESTS => UpstreamErrorKind::RateLimited,
        _ => UpstreamErrorKind::Transient,
    }
}

#[derive(Debug, Clone)]
pub struct ReportingClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ReportingClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://reporting.example.com/v3".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// HTTP implementation of [`PerformanceSource`]:
/// `POST {base}/sites/{site}/query` with bearer auth.
#[derive(Debug)]
pub struct HttpReportingClient {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpReportingClient {
    pub fn new(config: ReportingClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing reporting API base URL '{}'", config.base_url))?;
        Ok(Self {
            client,
            base,
            token: config.token,
        })
    }

    /// The site URL travels as a single percent-encoded path segment.
    fn query_url(&self, site: &str) -> Result<Url, SyncError> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                SyncError::Configuration(format!(
                    "reporting base URL '{}' cannot hold path segments",
                    self.base
                ))
            })?;
            segments.pop_if_empty();
            segments.push("sites");
            segments.push(site);
            segments.push("query");
        }
        Ok(url)
    }
}

fn upstream_transport(site: &str, err: &reqwest::Error) -> SyncError {
    SyncError::Upstream {
        site: site.to_string(),
        kind: UpstreamErrorKind::Transient,
        message: format!("transport error: {err}"),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[async_trait]
impl PerformanceSource for HttpReportingClient {
    async fn fetch_page(
        &self,
        site: &str,
        window: DateWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiRow>, SyncError> {
        let url = self.query_url(site)?;
        let body = QueryRequest {
            start_date: window.start,
            end_date: window.end,
            row_limit: limit,
            start_row: offset,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream_transport(site, &e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SyncError::Upstream {
                site: site.to_string(),
                kind: classify_status(status),
                message: format!("http {status}: {}", truncate_chars(&detail, 300)),
            });
        }

        let parsed: QueryResponse = response.json().await.map_err(|e| SyncError::Upstream {
            site: site.to_string(),
            kind: UpstreamErrorKind::Transient,
            message: format!("decoding response body: {e}"),
        })?;
        debug!(site, offset, rows = parsed.rows.len(), "fetched report page");
        Ok(parsed.rows)
    }
}

/// Minimum spacing between upstream requests, shared across page fetches.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Pull the complete row set for one site: pages of `page_size` rows at
/// increasing offsets until a short page (upstream exhausted) or the
/// `max_rows` cap. Every page fetch goes through the retry kernel.
pub async fn extract_site(
    source: &dyn PerformanceSource,
    policy: RetryPolicy,
    pacer: Option<&RequestPacer>,
    site: &str,
    window: DateWindow,
    page_size: usize,
    max_rows: usize,
) -> Result<Vec<ApiRow>, SyncError> {
    let page_size = page_size.max(1);
    let max_rows = max_rows.max(1);
    let mut rows: Vec<ApiRow> = Vec::new();
    let mut offset = 0usize;

    loop {
        if let Some(pacer) = pacer {
            pacer.pace().await;
        }
        let limit = page_size.min(max_rows - rows.len());
        let page = retry("extract", policy, || {
            source.fetch_page(site, window, limit, offset)
        })
        .await?;
        let fetched = page.len();
        rows.extend(page);

        if rows.len() >= max_rows {
            warn!(site, rows = rows.len(), max_rows, "row cap reached; stopping extraction");
            rows.truncate(max_rows);
            break;
        }
        if fetched < limit {
            break;
        }
        offset += fetched;
    }

    debug!(site, rows = rows.len(), "extraction finished");
    Ok(rows)
}
