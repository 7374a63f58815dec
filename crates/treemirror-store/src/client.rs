//! Remote store HTTP client
//!
//! Typed client for the store's file endpoints:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list      | `GET {base}/stores/{store}/files?path_prefix=..&cursor=..` |
//! | upload    | `PUT {base}/stores/{store}/files?external_id=..&overwrite=true` |
//! | delete    | `DELETE {base}/stores/{store}/files?external_id=..` |
//!
//! Uploads carry their metadata in `x-treemirror-*` headers, which the store
//! hands back in the `metadata` object of each listed file.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::TryStreamExt;
//! use treemirror_core::ports::IRemoteStore;
//! use treemirror_store::StoreClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = StoreClient::new("api-key-here");
//! let records: Vec<_> = client.list_files("my-store", Some("/repo")).try_collect().await?;
//! println!("{} files stored", records.len());
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use treemirror_core::config::StoreConfig;
use treemirror_core::domain::{ExternalId, FileDigest, RemoteFileRecord};
use treemirror_core::ports::{
    IRemoteStore, RecordStream, RemoteStoreError, UploadBody, UploadRequest,
};

use crate::retry::{is_transient_error, is_transient_status, RetryPolicy};

/// Base URL of the hosted store API
const DEFAULT_BASE_URL: &str = "https://api.treemirror.dev/v1";

/// Header carrying the local path of an uploaded file
pub const PATH_HEADER: &str = "x-treemirror-path";
/// Header carrying the content digest of an uploaded file
pub const HASH_HEADER: &str = "x-treemirror-hash";
/// Header carrying the local modify-time (RFC 3339, milliseconds)
pub const MTIME_HEADER: &str = "x-treemirror-mtime";
/// Header carrying the size in bytes of an uploaded file
pub const SIZE_HEADER: &str = "x-treemirror-size";

// ============================================================================
// Store API response types
// ============================================================================

/// One page of `GET /stores/{id}/files`
#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    data: Vec<WireFile>,
    /// Opaque cursor of the following page, absent on the last one
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    external_id: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: Option<WireMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMetadata {
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    mtime: Option<WireTime>,
    #[serde(default)]
    size: Option<u64>,
}

/// Stored modify-time, either RFC 3339 text or epoch milliseconds
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTime {
    Millis(i64),
    Text(String),
}

impl WireTime {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTime::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            WireTime::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl WireFile {
    /// Converts a listed file, dropping metadata fields that do not parse
    ///
    /// Returns `None` for entries without a usable external id.
    fn into_record(self) -> Option<RemoteFileRecord> {
        let external_id = match ExternalId::new(self.external_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "Skipping listed file with invalid external id");
                return None;
            }
        };

        let metadata = self.metadata.unwrap_or_default();
        let hash = metadata.hash.and_then(|raw| match FileDigest::new(raw) {
            Ok(digest) => Some(digest),
            Err(err) => {
                debug!(external_id = %external_id, error = %err, "Ignoring unparseable stored hash");
                None
            }
        });

        Some(RemoteFileRecord {
            mtime: metadata.mtime.as_ref().and_then(WireTime::to_datetime),
            size: metadata.size,
            hash,
            object_id: self.id,
            external_id,
        })
    }
}

/// Error payload returned by the store on failure
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// StoreClient
// ============================================================================

/// HTTP client for the remote store API
///
/// Cheap to share behind an `Arc`; `reqwest::Client` pools connections and
/// every method takes `&self`.
#[derive(Debug, Clone)]
pub struct StoreClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL for API requests, without trailing slash
    base_url: String,
    /// Bearer token sent with every request
    api_key: String,
    /// Backoff applied to transient failures
    retry: RetryPolicy,
}

impl StoreClient {
    /// Creates a client for the hosted store API
    ///
    /// # Arguments
    /// * `api_key` - Bearer token for the store account
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Creates a client with a custom base URL (useful for testing)
    ///
    /// # Arguments
    /// * `api_key` - Bearer token for the store account
    /// * `base_url` - Base URL for API requests
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Builds a client from the `store` configuration section
    ///
    /// The token is read from the environment variable named by
    /// `api_key_env`.
    ///
    /// # Errors
    /// Returns an error if that variable is unset or empty
    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "Environment variable {} is not set; export your store API key there",
                config.api_key_env
            )
        })?;
        if api_key.trim().is_empty() {
            anyhow::bail!("Environment variable {} is empty", config.api_key_env);
        }
        Ok(Self::with_base_url(api_key, config.base_url.clone()))
    }

    /// Replaces the backoff schedule
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the base URL for API requests
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn files_url(&self, store_id: &str) -> String {
        format!("{}/stores/{}/files", self.base_url, store_id)
    }

    /// Sends the request produced by `build`, retrying transient failures
    ///
    /// `build` runs once per attempt so streamed bodies can be reopened.
    async fn send_with_retry<F, Fut>(
        &self,
        operation: &str,
        build: F,
    ) -> Result<Response, RemoteStoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RequestBuilder, RemoteStoreError>>,
    {
        let mut attempt = 0;
        loop {
            let request = build().await?.bearer_auth(&self.api_key);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    if attempt > 0 {
                        info!(operation, attempt, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Ok(response)
                    if is_transient_status(response.status())
                        && self.retry.should_retry(attempt) =>
                {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        status = %response.status(),
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Err(error_from_response(operation, response).await),
                Err(err) if is_transient_error(&err) && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(RemoteStoreError::classify(format!(
                        "{operation} request failed: {err}"
                    )))
                }
            }
            attempt += 1;
        }
    }

    /// Fetches one listing page
    async fn fetch_page(
        &self,
        store_id: &str,
        path_prefix: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListPage, RemoteStoreError> {
        let response = self
            .send_with_retry("list_files", move || async move {
                let mut request = self.client.get(self.files_url(store_id));
                if let Some(prefix) = path_prefix {
                    request = request.query(&[("path_prefix", prefix)]);
                }
                if let Some(cursor) = cursor {
                    request = request.query(&[("cursor", cursor)]);
                }
                Ok(request)
            })
            .await?;

        response
            .json::<ListPage>()
            .await
            .map_err(|err| RemoteStoreError::Other(format!("Invalid listing response: {err}")))
    }

    /// Builds one upload attempt
    async fn upload_request(
        &self,
        store_id: &str,
        request: &UploadRequest,
    ) -> Result<RequestBuilder, RemoteStoreError> {
        let overwrite = if request.overwrite { "true" } else { "false" };
        let mtime = request
            .metadata
            .mtime
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut builder = self
            .client
            .put(self.files_url(store_id))
            .query(&[
                ("external_id", request.external_id.as_str()),
                ("overwrite", overwrite),
            ])
            .header(HASH_HEADER, request.metadata.hash.as_str())
            .header(MTIME_HEADER, mtime)
            .header(SIZE_HEADER, request.metadata.size);

        match HeaderValue::from_bytes(request.metadata.path.as_bytes()) {
            Ok(value) => builder = builder.header(PATH_HEADER, value),
            Err(_) => debug!(
                external_id = %request.external_id,
                "Path not representable as a header, omitting"
            ),
        }

        let builder = match &request.body {
            UploadBody::Stream(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|err| {
                    RemoteStoreError::Other(format!("Failed to open {}: {err}", path.display()))
                })?;
                builder
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(Body::wrap_stream(ReaderStream::new(file)))
            }
            UploadBody::Text(text) => builder
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(text.clone()),
        };
        Ok(builder)
    }
}

/// Turns a non-success response into a tagged store error
///
/// 402 is always quota and 404 always not-found; anything else is
/// classified from the status line and the error message in the body.
async fn error_from_response(operation: &str, response: Response) -> RemoteStoreError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message.or(body.error))
        .unwrap_or_else(|| text.trim().to_string());

    let message = if detail.is_empty() {
        format!("{operation} failed with HTTP {status}")
    } else {
        format!("{operation} failed with HTTP {status}: {detail}")
    };

    match status {
        StatusCode::PAYMENT_REQUIRED => RemoteStoreError::QuotaExceeded(message),
        StatusCode::NOT_FOUND => RemoteStoreError::NotFound(message),
        _ => RemoteStoreError::classify(message),
    }
}

#[async_trait::async_trait]
impl IRemoteStore for StoreClient {
    fn list_files<'a>(
        &'a self,
        store_id: &'a str,
        path_prefix: Option<&'a str>,
    ) -> RecordStream<'a> {
        // State is the cursor of the next page to fetch; `None` ends the stream
        stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(cursor) = state else {
                return Ok(None);
            };

            let page = self
                .fetch_page(store_id, path_prefix, cursor.as_deref())
                .await?;
            debug!(
                store_id,
                count = page.data.len(),
                has_more = page.next_cursor.is_some(),
                "Fetched listing page"
            );

            let next = page
                .next_cursor
                .filter(|c| !c.is_empty())
                .map(Some);
            let records: Vec<RemoteFileRecord> =
                page.data.into_iter().filter_map(WireFile::into_record).collect();
            Ok::<_, RemoteStoreError>(Some((records, next)))
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, RemoteStoreError>)))
        .try_flatten()
        .boxed()
    }

    #[tracing::instrument(skip_all, fields(store_id = %store_id, external_id = %request.external_id))]
    async fn upload_file(
        &self,
        store_id: &str,
        request: UploadRequest,
    ) -> Result<(), RemoteStoreError> {
        let request = &request;
        self.send_with_retry("upload_file", move || {
            self.upload_request(store_id, request)
        })
        .await?;
        debug!("Uploaded");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(store_id = %store_id, external_id = %external_id))]
    async fn delete_file(
        &self,
        store_id: &str,
        external_id: &ExternalId,
    ) -> Result<(), RemoteStoreError> {
        self.send_with_retry("delete_file", move || async move {
            Ok(self
                .client
                .delete(self.files_url(store_id))
                .query(&[("external_id", external_id.as_str())]))
        })
        .await?;
        debug!("Deleted");
        Ok(())
    }
}
