//! Result Store Writer: every store mutation issued by the engine goes
//! through here.
//!
//! Transient storage failures are retried with full-jitter exponential
//! backoff, independently of any provider retry budget. When the budget is
//! spent (or the error is permanent) the write is abandoned: the failure is
//! logged and counted and the caller keeps going, so a branch always settles.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{ArchiveStore, FieldPatch, ItemStore, VerificationStore};
use crate::error::StoreError;
use crate::model::{DeskId, ItemId, VerificationId};
use crate::observability::Metrics;
use crate::util::retry::Backoff;

/// Bounded retry budget for one store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl WritePolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
        }
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Abandoned,
}

impl WriteOutcome {
    #[must_use]
    pub fn is_applied(self) -> bool {
        self == WriteOutcome::Applied
    }
}

#[derive(Clone)]
pub struct StoreWriter {
    items: Arc<dyn ItemStore>,
    records: Arc<dyn VerificationStore>,
    archive: Arc<dyn ArchiveStore>,
    policy: WritePolicy,
    metrics: Arc<Metrics>,
}

impl StoreWriter {
    pub fn new(
        items: Arc<dyn ItemStore>,
        records: Arc<dyn VerificationStore>,
        archive: Arc<dyn ArchiveStore>,
        policy: WritePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            items,
            records,
            archive,
            policy,
            metrics,
        }
    }

    pub async fn patch_item(&self, id: &ItemId, patch: &FieldPatch) -> WriteOutcome {
        self.run("patch_item", id.as_str(), || self.items.patch(id, patch))
            .await
    }

    pub async fn patch_record(&self, id: VerificationId, patch: &FieldPatch) -> WriteOutcome {
        self.run("patch_record", &id.to_string(), || {
            self.records.patch(id, patch)
        })
        .await
    }

    pub async fn fetch_into_desk(&self, item: &ItemId, desk: &DeskId) -> WriteOutcome {
        self.run("fetch_into_desk", item.as_str(), || {
            self.archive.fetch_into_desk(item, desk)
        })
        .await
    }

    pub async fn delete_item(&self, id: &ItemId) -> WriteOutcome {
        self.run("delete_item", id.as_str(), || self.items.delete(id))
            .await
    }

    async fn run<F, Fut>(&self, operation: &'static str, target: &str, mut write: F) -> WriteOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(operation, target, attempt, "store write succeeded after retry");
                    }
                    return WriteOutcome::Applied;
                }
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        target,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store failure, will retry after backoff"
                    );
                    self.metrics
                        .store_write_retries
                        .with_label_values(&[operation])
                        .inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        operation,
                        target,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        transient = err.is_transient(),
                        error = %err,
                        "store write abandoned"
                    );
                    self.metrics
                        .store_write_abandoned
                        .with_label_values(&[operation])
                        .inc();
                    return WriteOutcome::Abandoned;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IngestItem;
    use crate::store::MemoryStore;
    use prometheus::Registry;
    use serde_json::json;

    fn writer(store: &Arc<MemoryStore>, max_attempts: u32) -> (StoreWriter, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
        let writer = StoreWriter::new(
            store.clone(),
            store.clone(),
            store.clone(),
            WritePolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(50)),
            metrics.clone(),
        );
        (writer, metrics)
    }

    fn seed(store: &MemoryStore) -> ItemId {
        let item: IngestItem =
            serde_json::from_value(json!({ "_id": "item-1", "type": "picture" })).unwrap();
        store.insert_item(&item);
        item.id
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_applied() {
        let store = Arc::new(MemoryStore::new());
        let id = seed(&store);
        let (writer, metrics) = writer(&store, 5);
        store.fail_next_writes(2);

        let outcome = writer
            .patch_item(&id, &FieldPatch::new().set("verification.tineye", 4))
            .await;

        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(store.item_doc(&id).unwrap()["verification"]["tineye"], json!(4));
        assert!(
            (metrics.store_write_retries.with_label_values(&["patch_item"]).get() - 2.0).abs()
                < f64::EPSILON
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_abandoned_not_raised() {
        let store = Arc::new(MemoryStore::new());
        let id = seed(&store);
        let (writer, metrics) = writer(&store, 3);
        store.fail_next_writes(10);

        let outcome = writer.delete_item(&id).await;

        assert_eq!(outcome, WriteOutcome::Abandoned);
        assert!(store.item_doc(&id).is_some());
        assert!(
            (metrics.store_write_abandoned.with_label_values(&["delete_item"]).get() - 1.0).abs()
                < f64::EPSILON
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let (writer, metrics) = writer(&store, 5);

        let outcome = writer
            .patch_item(&ItemId::new("missing"), &FieldPatch::new().set("x", 1))
            .await;

        assert_eq!(outcome, WriteOutcome::Abandoned);
        assert!(
            metrics.store_write_retries.with_label_values(&["patch_item"]).get() < f64::EPSILON
        );
    }
}
