use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};

use super::VerificationEngine;
use super::task::{BranchContext, FinalizeTask, VerificationTask};
use crate::error::{BlobError, SweepError};
use crate::model::{DeskId, IngestItem, VerificationState};
use crate::providers::{ProviderArgs, SourceImage};
use crate::store::{FieldPatch, ItemFilter};

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Items fanned out to providers.
    pub dispatched: usize,
    /// Items without an original rendition, left for a later sweep.
    pub skipped_no_original: usize,
    /// Items left untouched because a store call failed or their document
    /// does not decode.
    pub failed: usize,
}

enum Dispatch {
    Started,
    NoOriginal,
    Failed,
}

impl VerificationEngine {
    /// Sweep entry point: discovers unverified pictures and starts one
    /// verification run per item without waiting for any of them.
    ///
    /// Fails only when the destination desk cannot be resolved, the item
    /// query breaks, or another sweep is still running.
    pub async fn verify_ingest(&self) -> Result<SweepReport, SweepError> {
        let _sweep = self
            .inner
            .sweep_lock
            .try_lock()
            .map_err(|_| SweepError::AlreadyRunning)?;
        self.inner.metrics.sweeps_total.inc();

        let desk = match self.resolve_desk().await {
            Ok(desk) => desk,
            Err(err) => {
                self.inner.metrics.sweeps_failed.inc();
                error!(desk = %self.inner.desk_name, error = %err, "verification sweep aborted");
                return Err(err);
            }
        };

        info!(desk_id = %desk, "checking for new ingested images for verification");
        let mut report = SweepReport::default();
        let mut items = self.inner.stores.items.find(ItemFilter::unverified_pictures());

        while let Some(item) = items.next().await {
            let item = match item {
                Ok(item) => item,
                Err(err) if err.is_item_level() => {
                    report.failed += 1;
                    warn!(error = %err, "skipping ingest item that cannot be decoded");
                    continue;
                }
                Err(err) => {
                    self.inner.metrics.sweeps_failed.inc();
                    error!(error = %err, ?report, "ingest query failed mid-sweep");
                    return Err(err.into());
                }
            };
            match self.dispatch_item(&item, &desk).await {
                Dispatch::Started => report.dispatched += 1,
                Dispatch::NoOriginal => report.skipped_no_original += 1,
                Dispatch::Failed => report.failed += 1,
            }
        }

        info!(
            dispatched = report.dispatched,
            skipped_no_original = report.skipped_no_original,
            failed = report.failed,
            "verification sweep finished"
        );
        Ok(report)
    }

    async fn resolve_desk(&self) -> Result<DeskId, SweepError> {
        self.inner
            .stores
            .desks
            .find_by_name(&self.inner.desk_name)
            .await?
            .ok_or_else(|| SweepError::DeskNotFound(self.inner.desk_name.clone()))
    }

    async fn dispatch_item(&self, item: &IngestItem, desk: &DeskId) -> Dispatch {
        let file_name = item.file_name().to_string();
        info!(item_id = %item.id, file_name = %file_name, "found new ingested item");

        // No record is created for an item whose bytes cannot be found.
        let original = match self.inner.stores.blobs.fetch_original(item).await {
            Ok(original) => original,
            Err(BlobError::ImageNotFound(_)) => {
                self.inner.metrics.items_skipped_no_original.inc();
                info!(item_id = %item.id, "no original rendition, leaving item for a later sweep");
                return Dispatch::NoOriginal;
            }
            Err(BlobError::Store(err)) => {
                warn!(item_id = %item.id, error = %err, "failed to read original image");
                return Dispatch::Failed;
            }
        };

        let verification_id = match self.inner.stores.records.create().await {
            Ok(id) => id,
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "failed to create verification record");
                return Dispatch::Failed;
            }
        };

        let marker = match serde_json::to_value(VerificationState::started(verification_id)) {
            Ok(state) => FieldPatch::new().set("verification", state),
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "failed to encode verification marker");
                return Dispatch::Failed;
            }
        };
        if !self.inner.writer.patch_item(&item.id, &marker).await.is_applied() {
            warn!(
                item_id = %item.id,
                verification_id = %verification_id,
                "could not mark item as in progress, not dispatching"
            );
            return Dispatch::Failed;
        }

        let ctx = BranchContext {
            item_id: item.id.clone(),
            file_name: file_name.clone(),
            verification_id,
        };
        let finalize = FinalizeTask {
            item_id: item.id.clone(),
            desk_id: desk.clone(),
            verification_id,
        };

        // The barrier must exist before any branch can arrive at it.
        let providers = &self.inner.providers;
        if let Some(finalize) =
            self.inner
                .joins
                .register(verification_id, providers.branch_ids(), finalize)
        {
            self.inner.sink.enqueue(VerificationTask::Finalize(finalize));
        }
        self.refresh_open_joins();

        let source = SourceImage::new(file_name, original);
        for entry in providers.sync_entries() {
            self.inner.sink.enqueue(VerificationTask::ProviderBranch {
                ctx: ctx.clone(),
                provider: entry.adapter.name(),
                args: ProviderArgs::select(&source, entry.adapter.inputs()),
                attempt: 0,
            });
        }
        if let Some(entry) = providers.asynchronous() {
            self.inner.sink.enqueue(VerificationTask::AsyncSubmit {
                ctx: ctx.clone(),
                provider: entry.adapter.name(),
                image_url: source.href.clone(),
                attempt: 0,
            });
        }

        self.inner.metrics.items_dispatched.inc();
        info!(
            item_id = %item.id,
            verification_id = %verification_id,
            branches = providers.branch_ids().len(),
            "verification run dispatched"
        );
        Dispatch::Started
    }
}
