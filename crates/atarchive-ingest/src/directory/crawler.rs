//! Directory log crawler.
//!
//! Pages through `GET {base}/export?count=N&after=CURSOR`. The response is
//! JSON lines in log order; the cursor for the next page is the `createdAt` of
//! the last entry we could parse, exactly as the server assigned it. An empty
//! page means the crawl has reached the end of currently known history.
//!
//! A crawl can be resumed at any time with the last cursor it returned. Calling
//! [`DirectoryCrawler::crawl`] again later picks up operations appended since.
//!
//! [`DirectoryCrawler::audit_log`] fetches one identifier's complete history
//! from `GET {base}/{did}/log/audit`, for checking or repairing a single
//! identity without a full crawl.

use std::time::Duration;

use atarchive_core::{LogEntry, Operation};
use chrono::DateTime;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::backoff::{self, RetryPolicy};
use crate::{Error, Result};

/// Configuration for the directory crawler.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Directory base URL.
    /// Default: "https://plc.directory"
    pub base_url: String,

    /// Entries requested per page.
    /// Default: 1000
    pub page_size: usize,

    /// Per-request timeout.
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Retries per page. Rate-limited responses count as attempts.
    /// Default: 5 attempts, 5s doubling to 300s
    pub retry: RetryPolicy,

    /// Wait used when a rate-limited response names no delay.
    /// Default: 30 seconds
    pub rate_limit_delay: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://plc.directory".to_string(),
            page_size: 1000,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(5, Duration::from_secs(5), Duration::from_secs(300)),
            rate_limit_delay: Duration::from_secs(30),
        }
    }
}

/// One page of the log.
#[derive(Debug, Clone)]
pub struct CrawlPage {
    /// Every line that parsed as a log entry, in log order.
    pub entries: Vec<LogEntry>,
    /// Entries that normalized into operations, in log order.
    pub operations: Vec<Operation>,
    /// Cursor to pass to resume after this page.
    pub cursor: String,
    /// Lines skipped as malformed.
    pub malformed: usize,
}

/// HTTP client for the directory export.
#[derive(Clone)]
pub struct DirectoryCrawler {
    config: CrawlerConfig,
    client: reqwest::Client,
}

impl DirectoryCrawler {
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("atarchive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Start a crawl after `cursor`, or from the beginning of the log.
    pub fn crawl(&self, cursor: Option<String>) -> Crawl<'_> {
        info!("Directory crawl starting after {:?}", cursor);
        Crawl {
            crawler: self,
            cursor,
            done: false,
        }
    }

    /// Fetch the full audit log of `did`, oldest first, retrying transient
    /// failures with the crawl's retry policy.
    pub async fn audit_log(&self, did: &str) -> Result<Vec<LogEntry>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match self.fetch_audit_log(did).await {
                Ok(entries) => {
                    debug!("Audit log for {}: {} entries", did, entries.len());
                    return Ok(entries);
                }
                Err(e) => e,
            };

            let Some(delay) = self.retry_delay(&error, attempts) else {
                return Err(error);
            };
            warn!(
                "Audit log for {} failed ({}), retrying in {:?} (attempt {})",
                did, error, delay, attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn fetch_audit_log(&self, did: &str) -> Result<Vec<LogEntry>> {
        let url = format!("{}/{}/log/audit", self.config.base_url.trim_end_matches('/'), did);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(did.to_string()));
        }
        check_status(&response)?;

        let body = response.text().await?;
        let entries: Vec<LogEntry> = serde_json::from_str(&body)?;
        if let Some(other) = entries.iter().find(|e| e.did != did) {
            return Err(Error::Decode(format!(
                "audit log for {} contains an entry for {}",
                did, other.did
            )));
        }
        Ok(entries)
    }

    /// Delay before the next attempt, or `None` if `error` should surface.
    fn retry_delay(&self, error: &Error, attempts: u32) -> Option<Duration> {
        if !error.is_transient() || !self.config.retry.allows(attempts) {
            return None;
        }
        metrics::counter!("crawler_retries_total", "class" => error.class()).increment(1);
        Some(match error {
            Error::RateLimited { retry_after } => retry_after.unwrap_or(self.config.rate_limit_delay),
            _ => self.config.retry.delay_for(attempts - 1),
        })
    }

    fn export_url(&self) -> String {
        format!("{}/export", self.config.base_url.trim_end_matches('/'))
    }

    /// One request, no retries. `Ok(None)` is the empty page.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Option<CrawlPage>> {
        let mut request = self
            .client
            .get(self.export_url())
            .query(&[("count", self.config.page_size.to_string())]);
        if let Some(after) = cursor {
            request = request.query(&[("after", after)]);
        }

        let response = request.send().await?;
        check_status(&response)?;

        let body = response.text().await?;
        parse_page(&body, cursor)
    }
}

fn check_status(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited {
            retry_after: backoff::retry_after(response.headers()),
        });
    }
    if !status.is_success() {
        return Err(Error::Http {
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Split an export body into entries, skipping malformed lines.
fn parse_page(body: &str, cursor: Option<&str>) -> Result<Option<CrawlPage>> {
    let mut entries = Vec::new();
    let mut operations = Vec::new();
    let mut malformed = 0;
    let mut lines = 0;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        lines += 1;

        let entry = match LogEntry::parse(line) {
            Ok(entry) if DateTime::parse_from_rfc3339(&entry.created_at).is_ok() => entry,
            Ok(entry) => {
                warn!("Skipping entry {} with bad createdAt {:?}", entry.cid, entry.created_at);
                malformed += 1;
                continue;
            }
            Err(e) => {
                warn!("Skipping unparseable log line: {}", e);
                malformed += 1;
                continue;
            }
        };

        match entry.to_operation() {
            Ok(op) => operations.push(op),
            Err(e) => debug!("Entry {} for {} kept unnormalized: {}", entry.cid, entry.did, e),
        }
        entries.push(entry);
    }

    if lines == 0 {
        return Ok(None);
    }

    if malformed > 0 {
        metrics::counter!("crawler_malformed_entries_total").increment(malformed as u64);
    }

    let Some(last) = entries.last() else {
        return Err(Error::MalformedPage {
            cursor: cursor.map(str::to_string),
            reason: format!("none of {} lines carry a usable createdAt", lines),
        });
    };

    Ok(Some(CrawlPage {
        cursor: last.created_at.clone(),
        entries,
        operations,
        malformed,
    }))
}

/// An in-progress crawl. Pull pages with [`next_page`](Self::next_page).
pub struct Crawl<'a> {
    crawler: &'a DirectoryCrawler,
    cursor: Option<String>,
    done: bool,
}

impl Crawl<'_> {
    /// Cursor of the last page returned, or the starting cursor.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch the next page, retrying transient failures.
    ///
    /// Returns `Ok(None)` once the log is exhausted. On error the cursor is
    /// unchanged, so the crawl can be resumed from [`cursor`](Self::cursor).
    pub async fn next_page(&mut self) -> Result<Option<CrawlPage>> {
        if self.done {
            return Ok(None);
        }

        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.crawler.fetch_page(self.cursor.as_deref()).await {
                Ok(Some(page)) => {
                    metrics::counter!("crawler_pages_total").increment(1);
                    metrics::counter!("crawler_operations_total")
                        .increment(page.entries.len() as u64);
                    debug!(
                        "Page after {:?}: {} entries, next cursor {}",
                        self.cursor,
                        page.entries.len(),
                        page.cursor
                    );
                    self.cursor = Some(page.cursor.clone());
                    return Ok(Some(page));
                }
                Ok(None) => {
                    info!("Directory crawl reached end of log at {:?}", self.cursor);
                    self.done = true;
                    return Ok(None);
                }
                Err(e @ Error::MalformedPage { .. }) => return Err(e),
                Err(e) => e,
            };

            let Some(delay) = self.crawler.retry_delay(&error, attempts) else {
                return Err(Error::Crawl {
                    cursor: self.cursor.clone(),
                    attempts,
                    source: Box::new(error),
                });
            };
            warn!(
                "Page after {:?} failed ({}), retrying in {:?} (attempt {})",
                self.cursor, error, delay, attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drain the crawl to the end of the log, returning every page.
    pub async fn collect_pages(mut self) -> Result<Vec<CrawlPage>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Log {
        lines: Arc<Vec<(String, String)>>,
        /// Respond with this status to the first `failures` requests.
        failures: Arc<AtomicUsize>,
        failure_status: StatusCode,
        requests: Arc<AtomicUsize>,
    }

    fn entry(n: usize) -> String {
        format!(
            r#"{{"did":"did:plc:user{n}","operation":{{"type":"plc_operation","prev":null,"services":{{"atproto_pds":{{"endpoint":"https://pds{n}.example.com"}}}},"rotationKeys":[],"alsoKnownAs":[]}},"cid":"bafyop{n}","nullified":false,"createdAt":"2024-01-01T00:00:0{n}.000Z"}}"#
        )
    }

    fn created_at(line: &str) -> String {
        serde_json::from_str::<serde_json::Value>(line).map_or_else(
            |_| String::new(),
            |v| v["createdAt"].as_str().unwrap_or_default().to_string(),
        )
    }

    async fn export(
        State(log): State<Log>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        log.requests.fetch_add(1, Ordering::SeqCst);
        if log
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let mut headers = HeaderMap::new();
            headers.insert("retry-after", "0".parse().unwrap());
            return (log.failure_status, headers, "slow down").into_response();
        }

        let count: usize = params["count"].parse().unwrap();
        let after = params.get("after").cloned().unwrap_or_default();
        let body: Vec<&str> = log
            .lines
            .iter()
            .filter(|(ts, _)| ts.is_empty() || *ts > after)
            .take(count)
            .map(|(_, line)| line.as_str())
            .collect();
        body.join("\n").into_response()
    }

    async fn audit(State(log): State<Log>, Path(did): Path<String>) -> Response {
        log.requests.fetch_add(1, Ordering::SeqCst);
        if log
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (log.failure_status, "try later").into_response();
        }

        let history: Vec<serde_json::Value> = log
            .lines
            .iter()
            .filter_map(|(_, line)| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|v| v["did"] == did.as_str())
            .collect();
        if history.is_empty() {
            return (StatusCode::NOT_FOUND, "DID not registered").into_response();
        }
        serde_json::Value::Array(history).to_string().into_response()
    }

    async fn spawn_log(lines: Vec<String>, failures: usize, failure_status: StatusCode) -> (String, Log) {
        let log = Log {
            lines: Arc::new(lines.into_iter().map(|l| (created_at(&l), l)).collect()),
            failures: Arc::new(AtomicUsize::new(failures)),
            failure_status,
            requests: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/export", get(export))
            .route("/{did}/log/audit", get(audit))
            .with_state(log.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{addr}"), log)
    }

    fn crawler(base_url: String, page_size: usize) -> DirectoryCrawler {
        DirectoryCrawler::new(CrawlerConfig {
            base_url,
            page_size,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            rate_limit_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap()
    }

    fn cids(pages: &[CrawlPage]) -> Vec<String> {
        pages
            .iter()
            .flat_map(|p| p.operations.iter().map(|op| op.cid.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_crawl_to_end() {
        let (url, _) = spawn_log((1..=5).map(entry).collect(), 0, StatusCode::OK).await;
        let crawler = crawler(url, 2);

        let mut crawl = crawler.crawl(None);
        let mut pages = Vec::new();
        while let Some(page) = crawl.next_page().await.unwrap() {
            pages.push(page);
        }

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].cursor, "2024-01-01T00:00:02.000Z");
        assert_eq!(
            cids(&pages),
            vec!["bafyop1", "bafyop2", "bafyop3", "bafyop4", "bafyop5"]
        );
        assert_eq!(crawl.cursor(), Some("2024-01-01T00:00:05.000Z"));
        assert!(crawl.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_from_cursor_is_idempotent() {
        let (url, _) = spawn_log((1..=6).map(entry).collect(), 0, StatusCode::OK).await;
        let crawler = crawler(url, 2);

        let first = crawler
            .crawl(Some("2024-01-01T00:00:02.000Z".to_string()))
            .collect_pages()
            .await
            .unwrap();
        let second = crawler
            .crawl(Some("2024-01-01T00:00:02.000Z".to_string()))
            .collect_pages()
            .await
            .unwrap();

        assert_eq!(cids(&first), vec!["bafyop3", "bafyop4", "bafyop5", "bafyop6"]);
        assert_eq!(cids(&first), cids(&second));
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let lines = vec![
            entry(1),
            "{not json".to_string(),
            r#"{"did":"did:plc:x","operation":{"type":"mystery"},"cid":"bafyodd","createdAt":"2024-01-01T00:00:02.500Z"}"#.to_string(),
            entry(3),
        ];
        let (url, _) = spawn_log(lines, 0, StatusCode::OK).await;
        let crawler = crawler(url, 10);

        let mut crawl = crawler.crawl(None);
        let page = crawl.next_page().await.unwrap().unwrap();
        assert_eq!(page.malformed, 1);
        // The unknown operation type is archived but not normalized.
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.operations.len(), 2);
        assert_eq!(page.cursor, "2024-01-01T00:00:03.000Z");
    }

    #[test]
    fn test_page_without_cursor_is_fatal() {
        let err = parse_page("garbage\n{\"also\": \"garbage\"}\n", Some("2024-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedPage { cursor: Some(ref c), .. } if c == "2024-01-01T00:00:00Z"
        ));
        assert!(parse_page("\n\n", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let (url, log) = spawn_log(vec![entry(1)], 2, StatusCode::TOO_MANY_REQUESTS).await;
        let crawler = crawler(url, 10);

        let pages = crawler.crawl(None).collect_pages().await.unwrap();
        assert_eq!(cids(&pages), vec!["bafyop1"]);
        // Two rejected, one page, one empty page.
        assert_eq!(log.requests.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_cursor() {
        let (url, log) =
            spawn_log(vec![entry(1)], usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
        let crawler = crawler(url, 10);

        let mut crawl = crawler.crawl(Some("2023-12-31T00:00:00.000Z".to_string()));
        let err = crawl.next_page().await.unwrap_err();
        match err {
            Error::Crawl {
                cursor,
                attempts,
                source,
            } => {
                assert_eq!(cursor.as_deref(), Some("2023-12-31T00:00:00.000Z"));
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Http { status: 503 }));
            }
            other => panic!("expected crawl error, got {other:?}"),
        }
        assert_eq!(log.requests.load(Ordering::SeqCst), 3);
        assert_eq!(crawl.cursor(), Some("2023-12-31T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, log) = spawn_log(vec![entry(1)], usize::MAX, StatusCode::BAD_REQUEST).await;
        let crawler = crawler(url, 10);

        let err = crawler.crawl(None).next_page().await.unwrap_err();
        assert!(matches!(err, Error::Crawl { attempts: 1, .. }));
        assert_eq!(log.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_audit_log_returns_history_in_order() {
        let migration = r#"{"did":"did:plc:user1","operation":{"type":"plc_operation","prev":"bafyop1","services":{"atproto_pds":{"endpoint":"https://moved.example.com"}},"rotationKeys":[],"alsoKnownAs":[]},"cid":"bafymove","nullified":false,"createdAt":"2024-02-01T00:00:00.000Z"}"#;
        let (url, log) = spawn_log(
            vec![entry(1), entry(2), migration.to_string()],
            1,
            StatusCode::BAD_GATEWAY,
        )
        .await;
        let crawler = crawler(url, 10);

        let history = crawler.audit_log("did:plc:user1").await.unwrap();
        let cids: Vec<&str> = history.iter().map(|e| e.cid.as_str()).collect();
        assert_eq!(cids, vec!["bafyop1", "bafymove"]);
        assert_eq!(
            history[1].to_operation().unwrap().payload.endpoint(),
            Some("https://moved.example.com")
        );
        // One failed attempt, then the history.
        assert_eq!(log.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_audit_log_unknown_identifier() {
        let (url, log) = spawn_log(vec![entry(1)], 0, StatusCode::OK).await;
        let crawler = crawler(url, 10);

        let err = crawler.audit_log("did:plc:nobody").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref did) if did == "did:plc:nobody"));
        assert_eq!(log.requests.load(Ordering::SeqCst), 1);
    }
}
