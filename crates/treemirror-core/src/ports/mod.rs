//! Port definitions
//!
//! Traits for the collaborators the core depends on but does not implement.
//!
//! - [`IRemoteStore`] - the content-addressed remote store a tree is mirrored into

pub mod remote_store;

pub use remote_store::{
    IRemoteStore, RecordStream, RemoteStoreError, UploadBody, UploadMetadata, UploadRequest,
};
