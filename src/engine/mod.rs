//! Verification orchestration.
//!
//! A sweep fans every unverified picture out to the registered providers.
//! Each branch persists its own result as it settles and reports to the
//! run's join; the last arrival releases the finalizer, which routes the
//! item to the verified desk.

mod branch;
mod dispatcher;
mod finalizer;
pub mod join;
pub mod queue;
pub mod registry;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{VerificationId, VerificationRecord};
use crate::observability::Metrics;
use crate::store::{Collaborators, StoreWriter, WritePolicy};

pub use dispatcher::SweepReport;
pub use join::{Arrival, JoinRegistry};
pub use queue::{LocalQueue, TaskHandler, TaskSink};
pub use registry::{ProviderRegistry, RegistryError};
pub use task::{BranchContext, BranchId, FinalizeTask, VerificationTask};

/// Settings the engine needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub desk_name: String,
    pub write_policy: WritePolicy,
}

#[derive(Clone)]
pub struct VerificationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    stores: Collaborators,
    writer: StoreWriter,
    providers: ProviderRegistry,
    joins: JoinRegistry,
    sink: Arc<dyn TaskSink>,
    metrics: Arc<Metrics>,
    desk_name: String,
    sweep_lock: Mutex<()>,
}

impl VerificationEngine {
    pub fn new(
        stores: Collaborators,
        providers: ProviderRegistry,
        sink: Arc<dyn TaskSink>,
        settings: EngineSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let writer = StoreWriter::new(
            Arc::clone(&stores.items),
            Arc::clone(&stores.records),
            Arc::clone(&stores.archive),
            settings.write_policy,
            Arc::clone(&metrics),
        );
        Self {
            inner: Arc::new(EngineInner {
                stores,
                writer,
                providers,
                joins: JoinRegistry::new(),
                sink,
                metrics,
                desk_name: settings.desk_name,
                sweep_lock: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    /// Runs still waiting for at least one provider branch.
    #[must_use]
    pub fn open_runs(&self) -> usize {
        self.inner.joins.open()
    }

    pub async fn verification(
        &self,
        id: VerificationId,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        self.inner.stores.records.get(id).await
    }

    fn refresh_open_joins(&self) {
        self.inner
            .metrics
            .open_joins
            .set(i64::try_from(self.inner.joins.open()).unwrap_or(i64::MAX));
    }
}

#[async_trait]
impl TaskHandler for VerificationEngine {
    async fn handle(&self, task: VerificationTask) {
        match task {
            VerificationTask::ProviderBranch {
                ctx,
                provider,
                args,
                attempt,
            } => self.run_provider_branch(ctx, provider, args, attempt).await,
            VerificationTask::AsyncSubmit {
                ctx,
                provider,
                image_url,
                attempt,
            } => self.run_async_submit(ctx, provider, image_url, attempt).await,
            VerificationTask::AsyncResolve {
                ctx,
                provider,
                token,
                attempt,
            } => self.run_async_resolve(ctx, provider, token, attempt).await,
            VerificationTask::Finalize(task) => self.finalize(task).await,
        }
    }
}
