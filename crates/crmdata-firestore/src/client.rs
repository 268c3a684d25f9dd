//! Firestore REST API client.
//!
//! - Token caching with refresh margin, one forced refresh on an expired token
//! - HTTP client tuning (pooling, timeouts)
//! - Exponential backoff with jitter
//! - Observability (tracing spans, metrics)
//! - Document change polling for listeners

use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

use crmdata_models::DocKey;

use crate::convert::document_to_remote;
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::{record_listen_poll, record_request};
use crate::retry::RetryConfig;
use crate::token_cache::{TokenCache, EMULATOR_TOKEN};
use crate::transport::{ListenEvent, RemoteListener, RemoteSnapshot, MAX_COMMIT_WRITES};
use crate::types::{CommitRequest, CommitResponse, Document, RunQueryRequest, RunQueryResponse, StructuredQuery, Write};

// =============================================================================
// Configuration
// =============================================================================

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
    /// `host:port` of a Firestore emulator; disables service-account auth
    pub emulator_host: Option<String>,
    /// How often a document listener polls for changes
    pub listen_poll_interval: Duration,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                FirestoreError::auth_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty",
            ));
        }

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let listen_poll_secs: u64 = std::env::var("FIRESTORE_LISTEN_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(10);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
            emulator_host: std::env::var("FIRESTORE_EMULATOR_HOST")
                .ok()
                .filter(|h| !h.is_empty()),
            listen_poll_interval: Duration::from_secs(listen_poll_secs),
        })
    }

    /// Config for a local emulator (or a mock server) at `host`.
    pub fn emulator(project_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            emulator_host: Some(host.into()),
            listen_poll_interval: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a new Firestore client.
    pub async fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let (base_url, token_cache) = match &config.emulator_host {
            Some(host) => (
                format!(
                    "http://{}/v1/projects/{}/databases/{}/documents",
                    host, config.project_id, config.database_id
                ),
                TokenCache::fixed(EMULATOR_TOKEN),
            ),
            None => (
                format!(
                    "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
                    config.project_id, config.database_id
                ),
                TokenCache::new(Self::create_auth_provider()?),
            ),
        };

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("crmdata-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        debug!(base_url = %base_url, "Firestore client ready");

        Ok(Self {
            http,
            config,
            base_url,
            token_cache: Arc::new(token_cache),
        })
    }

    fn create_auth_provider() -> FirestoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| FirestoreError::auth_error(format!("Failed to load service account: {}", e)))?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => Err(FirestoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> FirestoreResult<Self> {
        let config = FirestoreConfig::from_env()?;
        Self::new(config).await
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// Full resource name, as used inside commit writes.
    pub fn full_document_name(&self, key: &DocKey) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}",
            self.config.project_id,
            self.config.database_id,
            key.path()
        )
    }

    fn document_url(&self, key: &DocKey) -> String {
        format!("{}/{}", self.base_url, encode_path(&key.path()))
    }

    fn query_url(&self, parent_path: &str) -> String {
        if parent_path.is_empty() {
            format!("{}:runQuery", self.base_url)
        } else {
            format!("{}/{}:runQuery", self.base_url, encode_path(parent_path))
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Get a document, `None` if it does not exist.
    pub async fn get_document(&self, key: &DocKey) -> FirestoreResult<Option<Document>> {
        let url = self.document_url(key);

        self.execute_request("get_document", key.collection(), Some(key.doc_id()), async {
            let response = self.send_authorized(&url, |token| self.http.get(&url).bearer_auth(token)).await?;

            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Run a structured query.
    ///
    /// `parent_path` is the document containing the collection, e.g.
    /// "users/USER_ID" for "users/USER_ID/leads", or empty for a root
    /// collection.
    pub async fn run_query(&self, parent_path: &str, query: StructuredQuery) -> FirestoreResult<Vec<Document>> {
        let url = self.query_url(parent_path);
        let collection = query
            .from
            .first()
            .map(|c| c.collection_id.clone())
            .unwrap_or_default();
        let request = RunQueryRequest {
            structured_query: query,
        };

        self.execute_request("run_query", &collection, None, async {
            let response = self
                .send_authorized(&url, |token| self.http.post(&url).bearer_auth(token).json(&request))
                .await?;

            match response.status() {
                StatusCode::OK => {
                    let body = response.text().await.unwrap_or_default();
                    // runQuery streams a JSON array; entries without a document carry only readTime
                    let responses: Vec<RunQueryResponse> = serde_json::from_str(&body).map_err(|e| {
                        FirestoreError::InvalidResponse(format!(
                            "Failed to parse runQuery response: {} (body prefix: {})",
                            e,
                            body.chars().take(200).collect::<String>()
                        ))
                    })?;

                    Ok(responses.into_iter().filter_map(|r| r.document).collect())
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Apply writes atomically via `:commit`.
    pub async fn commit_writes(&self, writes: Vec<Write>) -> FirestoreResult<CommitResponse> {
        if writes.is_empty() {
            return Ok(CommitResponse::empty());
        }
        if writes.len() > MAX_COMMIT_WRITES {
            return Err(FirestoreError::request_failed(format!(
                "Commit exceeds {} write limit",
                MAX_COMMIT_WRITES
            )));
        }

        let url = format!("{}:commit", self.base_url);
        let count = writes.len();
        let request = CommitRequest { writes };

        let result = self
            .execute_request("commit", "batch", None, async {
                let response = self
                    .send_authorized(&url, |token| self.http.post(&url).bearer_auth(token).json(&request))
                    .await?;

                match response.status() {
                    StatusCode::OK => Ok(response.json::<CommitResponse>().await?),
                    status => Err(Self::handle_error_response(status, &url, response).await),
                }
            })
            .await?;

        crate::metrics::record_commit(count);
        Ok(result)
    }

    /// Execute with retry.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        crate::retry::with_retry(&self.config.retry, operation, op).await
    }

    /// Watch one document by polling its update time.
    ///
    /// The first poll always yields a snapshot; later polls yield one only
    /// when the document's update time (or existence) changes. Failed polls
    /// yield [`ListenEvent::Error`] and polling continues.
    pub fn poll_document(&self, key: &DocKey) -> RemoteListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        let key = key.clone();
        let period = self.config.listen_poll_interval;

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last_seen: Option<Option<String>> = None;

                loop {
                    ticker.tick().await;

                    let event = match client.get_document(&key).await {
                        Ok(doc) => {
                            let version = doc.as_ref().map(|d| d.update_time.clone().unwrap_or_default());
                            let changed = last_seen.as_ref() != Some(&version);
                            record_listen_poll(changed);
                            if !changed {
                                continue;
                            }
                            last_seen = Some(version);
                            ListenEvent::Snapshot(RemoteSnapshot {
                                document: doc.map(document_to_remote),
                                has_pending_writes: false,
                            })
                        }
                        Err(e) => {
                            warn!(document = %key, error = %e, "Document poll failed");
                            ListenEvent::Error(e.to_string())
                        }
                    };

                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            .instrument(info_span!("firestore_listen")),
        );

        let abort = task.abort_handle();
        RemoteListener::new(rx, move || abort.abort())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Send a request, refreshing the token once if the server reports it expired.
    async fn send_authorized<F>(&self, url: &str, build: F) -> FirestoreResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token_cache.get_token().await?;
        let response = build(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(FirestoreError::from_http_status(
                status.as_u16(),
                format!("{} failed: {}", url, body),
            ));
        }

        self.token_cache.invalidate().await;
        let token = self.token_cache.get_token().await?;
        Ok(build(&token).send().await?)
    }

    /// Execute a request with tracing and metrics.
    async fn execute_request<T, F>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        fut: F,
    ) -> FirestoreResult<T>
    where
        F: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = if let Some(id) = doc_id {
            info_span!("firestore_request", operation = %operation, collection = %collection, doc_id = %id)
        } else {
            info_span!("firestore_request", operation = %operation, collection = %collection)
        };

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn handle_error_response(status: StatusCode, url: &str, response: Response) -> FirestoreError {
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);

        let body = response.text().await.unwrap_or_default();
        match (status, retry_after_ms) {
            (StatusCode::TOO_MANY_REQUESTS, Some(ms)) => FirestoreError::RateLimited(ms),
            _ => FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body)),
        }
    }
}

/// Percent-encode each segment of a slash-separated path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Tests
// =============================================================================
