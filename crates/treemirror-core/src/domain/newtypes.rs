//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the remote store key ([`ExternalId`]) and for
//! content fingerprints ([`FileDigest`]). Each newtype checks its invariants
//! at construction time so the rest of the code can rely on them.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// ExternalId
// ============================================================================

/// Key of a file in the remote store
///
/// Always forward-slash separated, whatever the host path conventions are,
/// and never ends with a separator (except for the bare root `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalId(String);

impl ExternalId {
    /// Wraps an id received from the remote store
    ///
    /// # Errors
    /// Returns `DomainError::InvalidExternalId` if the id is empty
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidExternalId(
                "external id cannot be empty".to_string(),
            ));
        }

        let trimmed = if id.len() > 1 {
            id.trim_end_matches('/')
        } else {
            id.as_str()
        };
        if trimmed.is_empty() {
            return Ok(Self("/".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Builds the id of an absolute local path
    ///
    /// `.` components are dropped and `..` components are resolved lexically.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is relative or escapes
    /// the filesystem root
    pub fn from_path(path: &Path) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let mut prefix = String::new();
        let mut parts: Vec<String> = Vec::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().into_owned(),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(DomainError::InvalidPath(format!(
                            "Path escapes root via ..: {}",
                            path.display()
                        )));
                    }
                }
                Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            }
        }

        Ok(Self(format!("{}/{}", prefix, parts.join("/"))).normalized())
    }

    /// Builds a root-relative id (used when the store is shared between machines)
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInRoot` if `path` is not below `root`
    pub fn from_relative(path: &Path, root: &Path) -> Result<Self, DomainError> {
        let relative = path.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInRoot(format!(
                "{} is not within {}",
                path.display(),
                root.display()
            ))
        })?;

        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(c) => Some(c.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            return Err(DomainError::InvalidExternalId(format!(
                "root itself has no relative id: {}",
                root.display()
            )));
        }

        Ok(Self(parts.join("/")))
    }

    fn normalized(self) -> Self {
        if self.0.len() > 1 && self.0.ends_with('/') {
            Self(self.0.trim_end_matches('/').to_string())
        } else {
            self
        }
    }

    /// Returns the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this id equals `root` or lies below it
    ///
    /// The comparison is component-aware: `/repo/src` is within `/repo`,
    /// `/repository` is not.
    #[must_use]
    pub fn is_within(&self, root: &ExternalId) -> bool {
        if self == root {
            return true;
        }
        let base = root.0.trim_end_matches('/');
        self.0
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Display for ExternalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExternalId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ExternalId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ExternalId> for String {
    fn from(id: ExternalId) -> Self {
        id.0
    }
}

// ============================================================================
// FileDigest
// ============================================================================

/// Hash algorithm a [`FileDigest`] was produced with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// BLAKE3, stored as `blake3:<64 hex>`
    Blake3,
    /// SHA-256, stored as bare `<64 hex>` by older clients
    Sha256,
}

impl DigestAlgorithm {
    /// Prefix written in front of the hex digest, if any
    #[must_use]
    pub const fn prefix(self) -> Option<&'static str> {
        match self {
            DigestAlgorithm::Blake3 => Some("blake3"),
            DigestAlgorithm::Sha256 => None,
        }
    }
}

/// Content fingerprint as stored in remote metadata
///
/// The format prefix tells which algorithm produced it, so a stored digest
/// can always be recomputed with the matching algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileDigest(String);

impl FileDigest {
    /// Length of a hex-encoded 256-bit digest
    const HEX_LEN: usize = 64;

    /// Parses a stored digest string
    ///
    /// # Errors
    /// Returns `DomainError::InvalidDigest` for unknown prefixes or malformed hex
    pub fn new(digest: impl Into<String>) -> Result<Self, DomainError> {
        let digest = digest.into();
        let hex_part = match digest.split_once(':') {
            Some(("blake3", rest)) => rest,
            Some(_) => return Err(DomainError::InvalidDigest(digest)),
            None => digest.as_str(),
        };

        if hex_part.len() != Self::HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidDigest(digest));
        }

        Ok(Self(digest.to_ascii_lowercase()))
    }

    /// Builds a digest from raw bytes produced by `algorithm`
    #[must_use]
    pub fn from_parts(algorithm: DigestAlgorithm, hex: &str) -> Self {
        match algorithm.prefix() {
            Some(prefix) => Self(format!("{prefix}:{hex}")),
            None => Self(hex.to_string()),
        }
    }

    /// Algorithm that produced this digest
    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        if self.0.starts_with("blake3:") {
            DigestAlgorithm::Blake3
        } else {
            DigestAlgorithm::Sha256
        }
    }

    /// Hex portion without the algorithm prefix
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h)
    }

    /// Full stored representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileDigest {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for FileDigest {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileDigest> for String {
    fn from(d: FileDigest) -> Self {
        d.0
    }
}
