//! Remote metadata snapshot
//!
//! A [`RemoteMetadataIndex`] is built once at the start of a sync pass by
//! draining the store listing, then only read. It is never persisted: every
//! pass rebuilds its view from the remote store.

use std::collections::HashMap;

use futures::TryStreamExt;
use tracing::{debug, info};
use treemirror_core::domain::{ExternalId, RemoteFileRecord};
use treemirror_core::ports::{IRemoteStore, RemoteStoreError};

/// What the remote store reported for one root, keyed by external id
#[derive(Debug, Clone, Default)]
pub struct RemoteMetadataIndex {
    records: HashMap<ExternalId, RemoteFileRecord>,
}

impl RemoteMetadataIndex {
    /// Drains `store.list_files` into a new index
    ///
    /// # Errors
    /// Returns the first listing error; a partial index is never returned.
    #[tracing::instrument(skip(store))]
    pub async fn build(
        store: &dyn IRemoteStore,
        store_id: &str,
        path_prefix: Option<&str>,
    ) -> Result<Self, RemoteStoreError> {
        let mut records = HashMap::new();
        let mut stream = store.list_files(store_id, path_prefix);
        while let Some(record) = stream.try_next().await? {
            if let Some(previous) = records.insert(record.external_id.clone(), record) {
                debug!(external_id = %previous.external_id, "Duplicate listing entry, keeping last");
            }
        }

        info!(records = records.len(), "Remote metadata index built");
        Ok(Self { records })
    }

    /// Builds an index from already known records
    pub fn from_records(records: impl IntoIterator<Item = RemoteFileRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.external_id.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, external_id: &ExternalId) -> Option<&RemoteFileRecord> {
        self.records.get(external_id)
    }

    pub fn contains(&self, external_id: &ExternalId) -> bool {
        self.records.contains_key(external_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over all records in unspecified order
    pub fn records(&self) -> impl Iterator<Item = &RemoteFileRecord> {
        self.records.values()
    }

    /// Iterates over all external ids in unspecified order
    pub fn ids(&self) -> impl Iterator<Item = &ExternalId> {
        self.records.keys()
    }
}
