//! Domain types
//!
//! - Newtypes for remote keys and content digests
//! - Records describing remote files and running daemons
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;
pub mod records;

pub use errors::DomainError;
pub use newtypes::{DigestAlgorithm, ExternalId, FileDigest};
pub use records::{DaemonRecord, RemoteFileRecord};
