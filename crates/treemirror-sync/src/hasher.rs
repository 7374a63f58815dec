//! Content fingerprints
//!
//! New digests are BLAKE3 and carry a `blake3:` prefix. Digests written by
//! older clients are bare SHA-256 hex; [`hashes_match`] recomputes with
//! whichever algorithm the stored digest names.

use sha2::{Digest, Sha256};
use treemirror_core::domain::{DigestAlgorithm, FileDigest};

/// Fingerprint of `bytes` in the current format
pub fn hash(bytes: &[u8]) -> FileDigest {
    hash_with(DigestAlgorithm::Blake3, bytes)
}

/// Fingerprint of `bytes` in the legacy SHA-256 format
pub fn legacy_hash(bytes: &[u8]) -> FileDigest {
    hash_with(DigestAlgorithm::Sha256, bytes)
}

/// Fingerprint of `bytes` produced by `algorithm`
pub fn hash_with(algorithm: DigestAlgorithm, bytes: &[u8]) -> FileDigest {
    match algorithm {
        DigestAlgorithm::Blake3 => {
            FileDigest::from_parts(algorithm, blake3::hash(bytes).to_hex().as_str())
        }
        DigestAlgorithm::Sha256 => {
            FileDigest::from_parts(algorithm, &hex::encode(Sha256::digest(bytes)))
        }
    }
}

/// Returns true if `bytes` hashes to `stored` under the algorithm `stored` uses
pub fn hashes_match(stored: &FileDigest, bytes: &[u8]) -> bool {
    hash_with(stored.algorithm(), bytes).hex() == stored.hex()
}

/// Compares `content` against `stored` and fingerprints it off the runtime
///
/// Hashing runs on a blocking thread. Returns `None` when the content still
/// matches `stored`, otherwise the digest to upload with.
///
/// # Errors
/// Returns an error if the blocking task panicked or was cancelled
pub async fn digest_if_changed(
    stored: Option<FileDigest>,
    content: Vec<u8>,
) -> std::io::Result<Option<FileDigest>> {
    tokio::task::spawn_blocking(move || {
        if stored.is_some_and(|stored| hashes_match(&stored, &content)) {
            None
        } else {
            Some(hash(&content))
        }
    })
    .await
    .map_err(std::io::Error::other)
}
