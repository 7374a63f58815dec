//! Shared helpers for store API integration tests

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use treemirror_core::domain::{DigestAlgorithm, ExternalId, FileDigest};
use treemirror_core::ports::{UploadBody, UploadMetadata, UploadRequest};
use treemirror_store::{RetryPolicy, StoreClient};
use wiremock::MockServer;

/// Store id used by every test
pub const STORE: &str = "docs";

/// Path of the files endpoint for [`STORE`]
pub const FILES_PATH: &str = "/stores/docs/files";

/// Bearer token the client sends
pub const API_KEY: &str = "test-api-key";

/// Starts a mock server and returns a client pointing at it
///
/// Retries use a 10 ms base delay so backoff tests stay fast.
pub async fn setup_store_mock() -> (MockServer, StoreClient) {
    let server = MockServer::start().await;
    let client = StoreClient::with_base_url(API_KEY, server.uri()).with_retry_policy(RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
    });
    (server, client)
}

/// A listed file as the store returns it
pub fn file_json(external_id: &str, mtime: &str, size: u64) -> serde_json::Value {
    serde_json::json!({
        "external_id": external_id,
        "id": format!("obj-{external_id}"),
        "metadata": {
            "hash": format!("blake3:{}", "ab".repeat(32)),
            "mtime": mtime,
            "size": size
        }
    })
}

pub fn sample_digest() -> FileDigest {
    FileDigest::from_parts(DigestAlgorithm::Blake3, &"cd".repeat(32))
}

/// Upload request for `external_id` with fixed metadata
#[allow(dead_code)]
pub fn upload_request(external_id: &str, body: UploadBody, size: u64) -> UploadRequest {
    UploadRequest {
        external_id: ExternalId::new(external_id).unwrap(),
        body,
        overwrite: true,
        metadata: UploadMetadata {
            path: external_id.to_string(),
            hash: sample_digest(),
            mtime: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(250),
            size,
        },
    }
}

/// Stream body for a file on disk
#[allow(dead_code)]
pub fn stream_body(path: impl Into<PathBuf>) -> UploadBody {
    UploadBody::Stream(path.into())
}
