//! Ports to the collaborators that own items, records, blobs and desks.
//!
//! Every mutation goes through a [`FieldPatch`]: an ordered set of dotted
//! field paths and the JSON values to place there. Stores apply one patch
//! atomically and never touch fields the patch does not name, so concurrent
//! provider branches writing different keys of the same document never
//! clobber each other.

pub mod memory;
pub mod postgres;
pub mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::{BlobError, StoreError};
use crate::model::{
    DeskId, IngestItem, ItemId, ItemKind, OriginalImage, VerificationId, VerificationRecord,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use writer::{StoreWriter, WriteOutcome, WritePolicy};

/// A dotted path into a JSON document, e.g. `verification.tineye`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

/// Field-scoped partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    fields: Vec<(FieldPath, Value)>,
}

impl FieldPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        let path = FieldPath::parse(path);
        if !path.segments().is_empty() {
            self.fields.push((path, value.into()));
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &Value)> {
        self.fields.iter().map(|(path, value)| (path, value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Applies the patch to an in-memory document, creating missing
    /// intermediate objects and replacing non-object intermediates.
    pub fn apply_to(&self, doc: &mut Value) {
        for (path, value) in &self.fields {
            let Some((last, parents)) = path.segments().split_last() else {
                continue;
            };
            let mut cursor = &mut *doc;
            for segment in parents {
                cursor = ensure_object(cursor)
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            ensure_object(cursor).insert(last.clone(), value.clone());
        }
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Query used by the sweep to discover work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFilter {
    pub kind: Option<ItemKind>,
    pub verification_absent: bool,
}

impl ItemFilter {
    #[must_use]
    pub fn unverified_pictures() -> Self {
        Self {
            kind: Some(ItemKind::Picture),
            verification_absent: true,
        }
    }

    #[must_use]
    pub fn matches(&self, item: &IngestItem) -> bool {
        self.kind.is_none_or(|kind| item.kind == kind)
            && (!self.verification_absent || item.verification.is_none())
    }

    /// Same predicate on the raw document, the way the SQL query evaluates it.
    #[must_use]
    pub fn matches_doc(&self, doc: &Value) -> bool {
        self.kind
            .is_none_or(|kind| doc.get("type").and_then(Value::as_str) == Some(kind.as_str()))
            && (!self.verification_absent
                || doc.get("verification").is_none_or(Value::is_null))
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Lazy, finite stream of matching items. Not restartable: call again for
    /// a fresh scan.
    fn find(&self, filter: ItemFilter) -> BoxStream<'_, Result<IngestItem, StoreError>>;

    async fn patch(&self, id: &ItemId, patch: &FieldPatch) -> Result<(), StoreError>;

    /// Removing an item that is already gone succeeds.
    async fn delete(&self, id: &ItemId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn create(&self) -> Result<VerificationId, StoreError>;

    async fn patch(&self, id: VerificationId, patch: &FieldPatch) -> Result<(), StoreError>;

    async fn get(&self, id: VerificationId) -> Result<Option<VerificationRecord>, StoreError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Resolves the `original` rendition of `item` into its URL and bytes.
    async fn fetch_original(&self, item: &IngestItem) -> Result<OriginalImage, BlobError>;
}

#[async_trait]
pub trait DeskDirectory: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<DeskId>, StoreError>;
}

/// Readiness check of the backing database.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Copies the ingest item into `desk`. Repeating the call is a no-op.
    async fn fetch_into_desk(&self, item: &ItemId, desk: &DeskId) -> Result<(), StoreError>;
}

/// The set of storage collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub items: Arc<dyn ItemStore>,
    pub records: Arc<dyn VerificationStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub desks: Arc<dyn DeskDirectory>,
    pub archive: Arc<dyn ArchiveStore>,
}

impl Collaborators {
    /// Uses one backend for every port.
    pub fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: ItemStore + VerificationStore + BlobStore + DeskDirectory + ArchiveStore + 'static,
    {
        Self {
            items: store.clone(),
            records: store.clone(),
            blobs: store.clone(),
            desks: store.clone(),
            archive: store,
        }
    }
}
