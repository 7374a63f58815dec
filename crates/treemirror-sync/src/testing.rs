//! In-memory remote store used by the unit tests of this crate

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use treemirror_core::domain::{ExternalId, RemoteFileRecord};
use treemirror_core::ports::{
    IRemoteStore, RecordStream, RemoteStoreError, UploadBody, UploadRequest,
};

/// Which body an upload attempt carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Stream,
    Text,
}

#[derive(Default)]
struct State {
    records: BTreeMap<ExternalId, RemoteFileRecord>,
    uploads: Vec<(ExternalId, BodyKind)>,
    deletes: Vec<ExternalId>,
    listing_error: Option<RemoteStoreError>,
    fail_on_attempt: HashMap<usize, RemoteStoreError>,
    stream_error: Option<RemoteStoreError>,
}

/// Remote store fake recording every mutation
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    attempts: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutation sleeps for `delay` while counted as in flight
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert_record(&self, record: RemoteFileRecord) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.external_id.clone(), record);
    }

    pub fn fail_listing(&self, err: RemoteStoreError) {
        self.state.lock().unwrap().listing_error = Some(err);
    }

    /// The `attempt`-th mutation (1-based, uploads and deletes alike) fails
    pub fn fail_on_attempt(&self, attempt: usize, err: RemoteStoreError) {
        self.state
            .lock()
            .unwrap()
            .fail_on_attempt
            .insert(attempt, err);
    }

    /// Every streaming upload fails with `err`
    pub fn fail_streams(&self, err: RemoteStoreError) {
        self.state.lock().unwrap().stream_error = Some(err);
    }

    pub fn records(&self) -> BTreeMap<ExternalId, RemoteFileRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn uploads(&self) -> Vec<(ExternalId, BodyKind)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn deletes(&self) -> Vec<ExternalId> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock().unwrap();
        state.uploads.clear();
        state.deletes.clear();
        self.attempts.store(0, Ordering::SeqCst);
    }

    async fn begin(&self) -> Result<(), RemoteStoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.state.lock().unwrap().fail_on_attempt.remove(&attempt) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IRemoteStore for MemoryStore {
    fn list_files<'a>(
        &'a self,
        _store_id: &'a str,
        path_prefix: Option<&'a str>,
    ) -> RecordStream<'a> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.listing_error.clone() {
            return Box::pin(stream::iter(vec![Err(err)]));
        }

        let prefix = path_prefix.map(|p| ExternalId::new(p).unwrap());
        let items: Vec<_> = state
            .records
            .values()
            .filter(|r| prefix.as_ref().map_or(true, |p| r.external_id.is_within(p)))
            .cloned()
            .map(Ok)
            .collect();
        Box::pin(stream::iter(items))
    }

    async fn upload_file(
        &self,
        _store_id: &str,
        request: UploadRequest,
    ) -> Result<(), RemoteStoreError> {
        self.begin().await?;

        let mut state = self.state.lock().unwrap();
        let kind = match &request.body {
            UploadBody::Stream(_) => {
                if let Some(err) = state.stream_error.clone() {
                    return Err(err);
                }
                BodyKind::Stream
            }
            UploadBody::Text(_) => BodyKind::Text,
        };

        state.uploads.push((request.external_id.clone(), kind));
        state.records.insert(
            request.external_id.clone(),
            RemoteFileRecord {
                external_id: request.external_id,
                object_id: None,
                hash: Some(request.metadata.hash),
                mtime: Some(request.metadata.mtime),
                size: Some(request.metadata.size),
            },
        );
        Ok(())
    }

    async fn delete_file(
        &self,
        _store_id: &str,
        external_id: &ExternalId,
    ) -> Result<(), RemoteStoreError> {
        self.begin().await?;

        let mut state = self.state.lock().unwrap();
        state.deletes.push(external_id.clone());
        match state.records.remove(external_id) {
            Some(_) => Ok(()),
            None => Err(RemoteStoreError::NotFound(external_id.to_string())),
        }
    }
}
