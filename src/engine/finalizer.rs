use tracing::{error, info};

use super::VerificationEngine;
use super::task::FinalizeTask;
use crate::model::VerificationStatus;
use crate::store::FieldPatch;

impl VerificationEngine {
    /// Routes a fully settled item to the verified desk: mark it completed,
    /// fetch it into the desk, then drop it from ingest.
    ///
    /// Runs whatever the individual providers returned. The delete is
    /// skipped when the fetch was abandoned, so the item is never lost.
    pub(super) async fn finalize(&self, task: FinalizeTask) {
        let FinalizeTask {
            item_id,
            desk_id,
            verification_id,
        } = task;
        self.inner.metrics.finalizations.inc();
        info!(
            item_id = %item_id,
            desk_id = %desk_id,
            verification_id = %verification_id,
            "fetching item into verified desk"
        );

        let completed = FieldPatch::new().set(
            "verification.status",
            VerificationStatus::Completed.as_str(),
        );
        self.inner.writer.patch_item(&item_id, &completed).await;

        if !self
            .inner
            .writer
            .fetch_into_desk(&item_id, &desk_id)
            .await
            .is_applied()
        {
            error!(
                item_id = %item_id,
                desk_id = %desk_id,
                "fetch into desk abandoned, keeping ingest item"
            );
            return;
        }

        if self.inner.writer.delete_item(&item_id).await.is_applied() {
            info!(item_id = %item_id, desk_id = %desk_id, "verification finalized");
        }
    }
}
