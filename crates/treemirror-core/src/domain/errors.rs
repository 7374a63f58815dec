//! Domain error types
//!
//! Validation failures raised while constructing domain values.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path is not within the synchronized root
    #[error("Path not within sync root: {0}")]
    PathNotInRoot(String),

    /// Invalid external id
    #[error("Invalid external id: {0}")]
    InvalidExternalId(String),

    /// Invalid content digest (unknown algorithm prefix or malformed hex)
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("relative/path".to_string());
        assert_eq!(err.to_string(), "Invalid path: relative/path");

        let err = DomainError::InvalidDigest("md5:abc".to_string());
        assert_eq!(err.to_string(), "Invalid digest: md5:abc");
    }

    #[test]
    fn test_error_equality() {
        let a = DomainError::PathNotInRoot("/a".to_string());
        let b = DomainError::PathNotInRoot("/a".to_string());
        let c = DomainError::PathNotInRoot("/b".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
