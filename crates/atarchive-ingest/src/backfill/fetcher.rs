//! Repository snapshot fetcher.
//!
//! `GET {endpoint}/xrpc/com.atproto.sync.getRepo?did=...` returns the whole
//! repository as one CAR container. The body is never buffered: it is bridged
//! into a blocking reader and walked on the blocking pool, and records are
//! handed back through a bounded channel so a slow consumer slows the
//! download instead of growing memory.
//!
//! ```text
//! HTTP body ──▶ StreamReader ──▶ SyncIoBridge ──▶ RepoReader (spawn_blocking)
//!                                                        │ mpsc (bounded)
//!                                                        ▼
//!                                                  RecordStream
//! ```
//!
//! Dropping the [`RecordStream`] stops the walk and closes the connection.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use atarchive_core::{RepoReader, RepoRecord};
use futures::{Stream, TryStreamExt, stream};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};

use crate::backoff;
use crate::{Error, Result};

/// Records of one repository, in tree order. The first error ends the stream.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RepoRecord>> + Send>>;

/// Source of repository snapshots.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Start fetching `identifier` from `endpoint`.
    ///
    /// Errors known before the body starts (status codes, connection
    /// failures) are returned directly; later ones arrive on the stream.
    async fn fetch(&self, identifier: &str, endpoint: &str) -> Result<RecordStream>;
}

/// Configuration for [`RepositoryFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Whole-request timeout, body included.
    /// Default: 300 seconds
    pub request_timeout: Duration,

    /// Default: "atarchive/<version>"
    pub user_agent: String,

    /// Decoded records buffered ahead of the consumer.
    /// Default: 256
    pub channel_capacity: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            user_agent: concat!("atarchive/", env!("CARGO_PKG_VERSION")).to_string(),
            channel_capacity: 256,
        }
    }
}

/// XRPC error body.
#[derive(Debug, Default, Deserialize)]
struct XrpcError {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListReposPage {
    cursor: Option<String>,
    repos: Vec<ListedRepo>,
}

#[derive(Debug, Deserialize)]
struct ListedRepo {
    did: String,
    active: Option<bool>,
}

/// HTTP implementation of [`SnapshotFetcher`].
#[derive(Clone)]
pub struct RepositoryFetcher {
    config: FetcherConfig,
    client: reqwest::Client,
}

impl RepositoryFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn xrpc_url(endpoint: &str, method: &str) -> String {
        format!("{}/xrpc/{}", endpoint.trim_end_matches('/'), method)
    }

    /// Every active repository a host lists, following `listRepos` cursors.
    pub async fn list_repos(&self, endpoint: &str) -> Result<Vec<String>> {
        let url = Self::xrpc_url(endpoint, "com.atproto.sync.listRepos");
        let mut cursor: Option<String> = None;
        let mut identifiers = Vec::new();
        let mut inactive = 0;

        loop {
            let mut request = self.client.get(&url).query(&[("limit", "1000")]);
            if let Some(c) = &cursor {
                request = request.query(&[("cursor", c)]);
            }

            let response = check_status(request.send().await?, endpoint).await?;
            let page: ListReposPage = response
                .json()
                .await
                .map_err(|e| Error::Decode(format!("listRepos page from {}: {}", endpoint, e)))?;

            if page.repos.is_empty() {
                break;
            }
            for repo in page.repos {
                if repo.active.unwrap_or(true) {
                    identifiers.push(repo.did);
                } else {
                    inactive += 1;
                }
            }

            match page.cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => break,
            }
        }

        info!(
            "{} lists {} active repositories ({} inactive skipped)",
            endpoint,
            identifiers.len(),
            inactive
        );
        Ok(identifiers)
    }
}

#[async_trait]
impl SnapshotFetcher for RepositoryFetcher {
    async fn fetch(&self, identifier: &str, endpoint: &str) -> Result<RecordStream> {
        let response = self
            .client
            .get(Self::xrpc_url(endpoint, "com.atproto.sync.getRepo"))
            .query(&[("did", identifier)])
            .send()
            .await?;
        let response = check_status(response, identifier).await?;

        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let reader = SyncIoBridge::new(StreamReader::new(body));

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let identifier = identifier.to_string();
        tokio::task::spawn_blocking(move || walk_repository(reader, &identifier, tx));

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

/// Map a response status onto the failure taxonomy.
async fn check_status(response: reqwest::Response, subject: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            retry_after: backoff::retry_after(response.headers()),
        }),
        StatusCode::NOT_FOUND => Err(Error::NotFound(subject.to_string())),
        StatusCode::BAD_REQUEST => {
            let body: XrpcError = response.json().await.unwrap_or_default();
            match body.error.as_deref() {
                Some(
                    kind @ ("RepoNotFound" | "RepoTakendown" | "RepoDeactivated" | "RepoSuspended"),
                ) => Err(Error::NotFound(format!("{}: {}", subject, kind))),
                _ => {
                    debug!(
                        "Bad request for {}: {:?} {:?}",
                        subject, body.error, body.message
                    );
                    Err(Error::Http { status: 400 })
                }
            }
        }
        _ => Err(Error::Http {
            status: status.as_u16(),
        }),
    }
}

/// Core decode errors, except that a failing body read is a network failure.
fn classify(err: atarchive_core::Error) -> Error {
    match err {
        atarchive_core::Error::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => {
            Error::TransientNetwork(e.to_string())
        }
        other => other.into(),
    }
}

/// Runs on the blocking pool until the container ends, fails, or the
/// receiving side goes away.
fn walk_repository<R: io::Read>(
    reader: R,
    identifier: &str,
    tx: mpsc::Sender<Result<RepoRecord>>,
) {
    let mut repo = match RepoReader::new(reader) {
        Ok(repo) => repo,
        Err(e) => {
            let _ = tx.blocking_send(Err(classify(e)));
            return;
        }
    };

    let mut records: u64 = 0;
    for item in repo.by_ref() {
        let failed = item.is_err();
        if tx.blocking_send(item.map_err(classify)).is_err() {
            debug!("Fetch of {} abandoned after {} records", identifier, records);
            return;
        }
        if failed {
            return;
        }
        records += 1;
    }

    let Some(commit) = repo.commit() else {
        let _ = tx.blocking_send(Err(Error::CorruptContainer(
            "container has no commit block".to_string(),
        )));
        return;
    };
    if commit.did != identifier {
        warn!("Repository fetched for {} is signed for {}", identifier, commit.did);
    }

    let summary = repo.summary();
    if summary.missing_records > 0 || summary.missing_nodes > 0 {
        warn!(
            "Repository {} is incomplete: {} records and {} tree nodes missing",
            identifier, summary.missing_records, summary.missing_nodes
        );
    }
    metrics::counter!("backfill_records_total").increment(records);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use atarchive_core::repo::test_support::{TestRepo, build};
    use atarchive_core::car::test_support::encode_car;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::{Query, State};
    use axum::response::Response;
    use axum::routing::get;
    use futures::StreamExt;
    use std::sync::Arc;

    #[derive(Clone)]
    struct Reply {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    }

    impl Reply {
        fn ok(body: Vec<u8>) -> Self {
            Self {
                status: StatusCode::OK,
                headers: vec![("content-type", "application/vnd.ipld.car".to_string())],
                body,
            }
        }

        fn status(status: StatusCode, body: &str) -> Self {
            Self {
                status,
                headers: vec![("content-type", "application/json".to_string())],
                body: body.as_bytes().to_vec(),
            }
        }
    }

    type Replies = Arc<HashMap<String, Reply>>;

    fn respond(reply: Reply) -> Response {
        let mut builder = Response::builder().status(reply.status);
        for (name, value) in reply.headers {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(reply.body)).unwrap()
    }

    async fn get_repo(
        State(replies): State<Replies>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let reply = params
            .get("did")
            .and_then(|did| replies.get(did))
            .cloned()
            .unwrap_or_else(|| Reply::status(StatusCode::NOT_FOUND, "{}"));
        respond(reply)
    }

    async fn list_repos(
        State(replies): State<Replies>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let page = params.get("cursor").map_or("list:first", |c| c.as_str());
        respond(
            replies
                .get(page)
                .cloned()
                .unwrap_or_else(|| Reply::status(StatusCode::OK, r#"{"repos":[]}"#)),
        )
    }

    async fn spawn_pds(replies: HashMap<String, Reply>) -> String {
        let app = Router::new()
            .route("/xrpc/com.atproto.sync.getRepo", get(get_repo))
            .route("/xrpc/com.atproto.sync.listRepos", get(list_repos))
            .with_state(Arc::new(replies));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn fetcher() -> RepositoryFetcher {
        RepositoryFetcher::new(FetcherConfig {
            request_timeout: Duration::from_secs(10),
            channel_capacity: 1,
            ..Default::default()
        })
        .unwrap()
    }

    async fn fetch_all(endpoint: &str, did: &str) -> Vec<Result<RepoRecord>> {
        fetcher().fetch(did, endpoint).await.unwrap().collect().await
    }

    fn corrupted(repo: &TestRepo) -> Vec<u8> {
        let mut blocks = repo.blocks.clone();
        let last = blocks.last_mut().unwrap();
        let at = last.1.len() - 1;
        last.1[at] ^= 0xff;
        encode_car(&[repo.commit], &blocks)
    }

    #[tokio::test]
    async fn test_fetch_streams_records() {
        let repo = build();
        let endpoint = spawn_pds(HashMap::from([(
            "did:plc:testuser".to_string(),
            Reply::ok(repo.to_car()),
        )]))
        .await;

        let records: Vec<RepoRecord> = fetch_all(&endpoint, "did:plc:testuser")
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        let keys: Vec<String> = records
            .iter()
            .map(|r| format!("{}/{}", r.collection, r.record_key))
            .collect();
        let expected: Vec<String> = repo.records.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, expected);
        assert_eq!(records[0].value["text"], "first");
        assert!(records.iter().all(|r| r.collection == "app.bsky.feed.post"));
    }

    #[tokio::test]
    async fn test_corrupt_block_is_permanent() {
        let repo = build();
        let endpoint = spawn_pds(HashMap::from([(
            "did:plc:testuser".to_string(),
            Reply::ok(corrupted(&repo)),
        )]))
        .await;

        let items = fetch_all(&endpoint, "did:plc:testuser").await;
        let err = items.last().unwrap().as_ref().unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)), "{err}");
        assert!(err.is_permanent());
        assert!(items.len() <= repo.records.len());
    }

    #[tokio::test]
    async fn test_truncated_transfer_is_transient() {
        let car = build().to_car();
        let endpoint = spawn_pds(HashMap::from([(
            "did:plc:testuser".to_string(),
            Reply::ok(car[..car.len() - 5].to_vec()),
        )]))
        .await;

        let items = fetch_all(&endpoint, "did:plc:testuser").await;
        let err = items.last().unwrap().as_ref().unwrap_err();
        assert!(matches!(err, Error::Truncated(_)), "{err}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let endpoint = spawn_pds(HashMap::from([
            (
                "did:plc:gone".to_string(),
                Reply::status(
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"RepoTakendown","message":"Repo has been takendown"}"#,
                ),
            ),
            (
                "did:plc:busy".to_string(),
                Reply {
                    headers: vec![("retry-after", "7".to_string())],
                    ..Reply::status(StatusCode::TOO_MANY_REQUESTS, "{}")
                },
            ),
            (
                "did:plc:down".to_string(),
                Reply::status(StatusCode::BAD_GATEWAY, ""),
            ),
        ]))
        .await;
        let fetcher = fetcher();

        let missing = fetcher.fetch("did:plc:missing", &endpoint).await.err().unwrap();
        assert!(matches!(missing, Error::NotFound(_)));

        let gone = fetcher.fetch("did:plc:gone", &endpoint).await.err().unwrap();
        assert!(matches!(&gone, Error::NotFound(m) if m.contains("RepoTakendown")));
        assert!(gone.is_permanent());

        let busy = fetcher.fetch("did:plc:busy", &endpoint).await.err().unwrap();
        assert_eq!(busy.retry_after(), Some(Duration::from_secs(7)));

        let down = fetcher.fetch("did:plc:down", &endpoint).await.err().unwrap();
        assert!(matches!(down, Error::Http { status: 502 }));
        assert!(down.is_transient());
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_walk() {
        let endpoint = spawn_pds(HashMap::from([(
            "did:plc:testuser".to_string(),
            Reply::ok(build().to_car()),
        )]))
        .await;

        let mut records = fetcher().fetch("did:plc:testuser", &endpoint).await.unwrap();
        assert!(records.next().await.unwrap().is_ok());
        drop(records);
    }

    #[tokio::test]
    async fn test_list_repos_follows_cursor() {
        let endpoint = spawn_pds(HashMap::from([
            (
                "list:first".to_string(),
                Reply::status(
                    StatusCode::OK,
                    r#"{"cursor":"p2","repos":[{"did":"did:plc:a","head":"x","rev":"1"},{"did":"did:plc:b","active":false}]}"#,
                ),
            ),
            (
                "p2".to_string(),
                Reply::status(
                    StatusCode::OK,
                    r#"{"cursor":"p3","repos":[{"did":"did:plc:c","active":true}]}"#,
                ),
            ),
        ]))
        .await;

        let listed = fetcher().list_repos(&endpoint).await.unwrap();
        assert_eq!(listed, vec!["did:plc:a", "did:plc:c"]);
    }
}
