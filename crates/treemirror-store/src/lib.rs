//! treemirror store - HTTP adapter for the remote store
//!
//! Implements [`treemirror_core::ports::IRemoteStore`] over the store's REST
//! API:
//! - paginated listing of file records with their stored metadata
//! - streamed or text uploads with metadata headers
//! - deletes by external id
//!
//! ## Modules
//!
//! - [`client`] - the [`client::StoreClient`] adapter
//! - [`retry`] - exponential backoff for transient HTTP failures

pub mod client;
pub mod retry;

pub use client::StoreClient;
pub use retry::RetryPolicy;
