//! Remote store port (driven/secondary port)
//!
//! The remote store keeps one object per synchronized file, keyed by
//! [`ExternalId`], together with the metadata (digest, modify-time, size)
//! recorded when it was uploaded. Search and ranking live entirely behind
//! this interface and are not modelled here.
//!
//! ## Error model
//!
//! Adapters report failures as [`RemoteStoreError`]. The quota condition is
//! the only one the sync layer treats as fatal, so the string matching that
//! recognizes it lives in exactly one place: [`RemoteStoreError::classify`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::{ExternalId, FileDigest, RemoteFileRecord};

// ============================================================================
// RemoteStoreError
// ============================================================================

/// Failure reported by a remote store operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteStoreError {
    /// The account's usage ceiling has been reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The addressed object or store does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other failure (network, server, rejected request)
    #[error("{0}")]
    Other(String),
}

/// Substrings that identify a quota failure in a store message
const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "usage limit",
    "plan limit",
    "upgrade your plan",
    "limit exceeded",
];

impl RemoteStoreError {
    /// Maps a raw failure message onto a tagged variant
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
            RemoteStoreError::QuotaExceeded(message)
        } else if lower.contains("not found") {
            RemoteStoreError::NotFound(message)
        } else {
            RemoteStoreError::Other(message)
        }
    }

    /// Returns true for the quota condition
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, RemoteStoreError::QuotaExceeded(_))
    }

    /// Message without the variant label
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            RemoteStoreError::QuotaExceeded(m)
            | RemoteStoreError::NotFound(m)
            | RemoteStoreError::Other(m) => m,
        }
    }
}

// ============================================================================
// Upload request
// ============================================================================

/// Payload of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadBody {
    /// Stream the file at this path straight from disk
    Stream(PathBuf),
    /// Send an in-memory text body
    Text(String),
}

/// Metadata stored next to an uploaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Local path of the file, as a display string
    pub path: String,
    /// Digest of the uploaded content
    pub hash: FileDigest,
    /// Local modify-time at upload (millisecond precision)
    pub mtime: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

/// A single create-or-overwrite request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Key to store the object under
    pub external_id: ExternalId,
    /// Content to send
    pub body: UploadBody,
    /// Replace an existing object with the same key
    pub overwrite: bool,
    /// Metadata to record alongside the object
    pub metadata: UploadMetadata,
}

// ============================================================================
// IRemoteStore trait
// ============================================================================

/// Lazy sequence of remote records, paginated behind the scenes
pub type RecordStream<'a> = BoxStream<'a, Result<RemoteFileRecord, RemoteStoreError>>;

/// Port trait for remote store operations
///
/// Implementations must be safe to call concurrently: the sync executor
/// issues many uploads and deletes at once against one shared instance.
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Lists every record in `store_id`, optionally restricted to ids that
    /// start with `path_prefix`
    fn list_files<'a>(&'a self, store_id: &'a str, path_prefix: Option<&'a str>)
        -> RecordStream<'a>;

    /// Creates or overwrites one object
    async fn upload_file(
        &self,
        store_id: &str,
        request: UploadRequest,
    ) -> Result<(), RemoteStoreError>;

    /// Removes one object
    async fn delete_file(
        &self,
        store_id: &str,
        external_id: &ExternalId,
    ) -> Result<(), RemoteStoreError>;
}
