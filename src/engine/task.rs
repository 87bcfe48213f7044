//! Units of work exchanged between the engine and its task substrate.
//!
//! Tasks are plain data: everything a worker needs to run one step of a
//! verification run travels inside the task, including its attempt count.

use crate::model::{CorrelationToken, DeskId, ItemId, VerificationId};
use crate::providers::ProviderArgs;

/// Branches are identified by the provider they call.
pub type BranchId = &'static str;

/// Identifies the run a branch belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchContext {
    pub item_id: ItemId,
    pub file_name: String,
    pub verification_id: VerificationId,
}

/// Continuation released by the join once every branch has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeTask {
    pub item_id: ItemId,
    pub desk_id: DeskId,
    pub verification_id: VerificationId,
}

#[derive(Debug, Clone)]
pub enum VerificationTask {
    /// One synchronous provider call.
    ProviderBranch {
        ctx: BranchContext,
        provider: BranchId,
        args: ProviderArgs,
        attempt: u32,
    },
    /// Phase one of the asynchronous branch.
    AsyncSubmit {
        ctx: BranchContext,
        provider: BranchId,
        image_url: String,
        attempt: u32,
    },
    /// Phase two, chained after a successful submit.
    AsyncResolve {
        ctx: BranchContext,
        provider: BranchId,
        token: CorrelationToken,
        attempt: u32,
    },
    Finalize(FinalizeTask),
}

impl VerificationTask {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            VerificationTask::ProviderBranch { .. } => "provider_branch",
            VerificationTask::AsyncSubmit { .. } => "async_submit",
            VerificationTask::AsyncResolve { .. } => "async_resolve",
            VerificationTask::Finalize(_) => "finalize",
        }
    }

    #[must_use]
    pub fn item_id(&self) -> &ItemId {
        match self {
            VerificationTask::ProviderBranch { ctx, .. }
            | VerificationTask::AsyncSubmit { ctx, .. }
            | VerificationTask::AsyncResolve { ctx, .. } => &ctx.item_id,
            VerificationTask::Finalize(task) => &task.item_id,
        }
    }
}
