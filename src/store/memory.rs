//! In-process implementation of every store port.
//!
//! Same semantics as [`super::PgStore`] (field-scoped patches, idempotent
//! fetch and delete) plus fault injection, so the orchestration can be
//! exercised without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};

use super::{
    ArchiveStore, BlobStore, DeskDirectory, FieldPatch, ItemFilter, ItemStore, StoreHealth,
    VerificationStore,
};
use crate::error::{BlobError, StoreError};
use crate::model::{
    DeskId, IngestItem, ItemId, OriginalImage, VerificationId, VerificationRecord,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    ingest: BTreeMap<ItemId, Value>,
    records: HashMap<VerificationId, (Map<String, Value>, DateTime<Utc>)>,
    blobs: HashMap<String, Vec<u8>>,
    desks: HashMap<String, DeskId>,
    archive: BTreeMap<ItemId, (DeskId, Value)>,
    fetch_calls: HashMap<ItemId, usize>,
    failing_writes: u32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `item` as a CMS document, replacing any previous version.
    pub fn insert_item(&self, item: &IngestItem) {
        let doc = serde_json::to_value(item).unwrap_or(Value::Null);
        self.lock().ingest.insert(item.id.clone(), doc);
    }

    /// Stores a raw document as-is, even one that does not decode.
    pub fn insert_doc(&self, id: &ItemId, doc: Value) {
        self.lock().ingest.insert(id.clone(), doc);
    }

    pub fn put_blob(&self, media_id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().blobs.insert(media_id.into(), bytes.into());
    }

    pub fn add_desk(&self, name: impl Into<String>, id: DeskId) {
        self.lock().desks.insert(name.into(), id);
    }

    /// The next `count` writes (patch, fetch or delete) fail transiently.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    #[must_use]
    pub fn item_doc(&self, id: &ItemId) -> Option<Value> {
        self.lock().ingest.get(id).cloned()
    }

    #[must_use]
    pub fn record_results(&self, id: VerificationId) -> Option<Map<String, Value>> {
        self.lock().records.get(&id).map(|(results, _)| results.clone())
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn archived_desk(&self, id: &ItemId) -> Option<DeskId> {
        self.lock().archive.get(id).map(|(desk, _)| desk.clone())
    }

    #[must_use]
    pub fn archived_doc(&self, id: &ItemId) -> Option<Value> {
        self.lock().archive.get(id).map(|(_, doc)| doc.clone())
    }

    /// How many times the item was fetched into a desk (retries included).
    #[must_use]
    pub fn fetch_calls(&self, id: &ItemId) -> usize {
        self.lock().fetch_calls.get(id).copied().unwrap_or(0)
    }

    fn take_injected_failure(state: &mut MemoryState, op: &str) -> Result<(), StoreError> {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Transient(format!("injected {op} contention")));
        }
        Ok(())
    }
}

fn decode_item(id: &ItemId, doc: &Value) -> Result<IngestItem, StoreError> {
    let mut item: IngestItem =
        serde_json::from_value(doc.clone()).map_err(|error| StoreError::MalformedItem {
            id: id.to_string(),
            reason: error.to_string(),
        })?;
    item.id = id.clone();
    Ok(item)
}

#[async_trait]
impl ItemStore for MemoryStore {
    fn find(&self, filter: ItemFilter) -> BoxStream<'_, Result<IngestItem, StoreError>> {
        let snapshot: Vec<Result<IngestItem, StoreError>> = self
            .lock()
            .ingest
            .iter()
            .filter(|(_, doc)| filter.matches_doc(doc))
            .map(|(id, doc)| decode_item(id, doc))
            .collect();
        stream::iter(snapshot).boxed()
    }

    async fn patch(&self, id: &ItemId, patch: &FieldPatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::take_injected_failure(&mut state, "item patch")?;
        let doc = state.ingest.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "ingest item",
            id: id.to_string(),
        })?;
        patch.apply_to(doc);
        Ok(())
    }

    async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::take_injected_failure(&mut state, "item delete")?;
        state.ingest.remove(id);
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn create(&self) -> Result<VerificationId, StoreError> {
        let id = VerificationId::generate();
        self.lock().records.insert(id, (Map::new(), Utc::now()));
        Ok(id)
    }

    async fn patch(&self, id: VerificationId, patch: &FieldPatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::take_injected_failure(&mut state, "record patch")?;
        let (results, _) = state
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "verification record",
                id: id.to_string(),
            })?;
        let mut doc = Value::Object(std::mem::take(results));
        patch.apply_to(&mut doc);
        if let Value::Object(map) = doc {
            *results = map;
        }
        Ok(())
    }

    async fn get(&self, id: VerificationId) -> Result<Option<VerificationRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .get(&id)
            .map(|(results, created_at)| VerificationRecord {
                id,
                results: results.clone(),
                created_at: *created_at,
            }))
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn fetch_original(&self, item: &IngestItem) -> Result<OriginalImage, BlobError> {
        let rendition = item
            .original_rendition()
            .ok_or_else(|| BlobError::ImageNotFound(item.id.clone()))?;
        let bytes = self
            .lock()
            .blobs
            .get(&rendition.media)
            .cloned()
            .ok_or_else(|| BlobError::ImageNotFound(item.id.clone()))?;
        Ok(OriginalImage {
            href: rendition.href.clone(),
            bytes,
        })
    }
}

#[async_trait]
impl DeskDirectory for MemoryStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<DeskId>, StoreError> {
        Ok(self.lock().desks.get(name).cloned())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn fetch_into_desk(&self, item: &ItemId, desk: &DeskId) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::take_injected_failure(&mut state, "fetch")?;
        *state.fetch_calls.entry(item.clone()).or_default() += 1;
        if state.archive.contains_key(item) {
            return Ok(());
        }
        if let Some(doc) = state.ingest.get(item).cloned() {
            state.archive.insert(item.clone(), (desk.clone(), doc));
        }
        Ok(())
    }
}
