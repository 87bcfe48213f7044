//! Per-run barrier over the provider branches of one verification.
//!
//! A run is registered with the set of branches it fanned out to. Each
//! branch reports exactly when it reached a terminal result; the arrival
//! that completes the set removes the entry and hands back the finalize
//! continuation, so the finalizer is released at most once no matter how
//! arrivals interleave or repeat.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::task::{BranchId, FinalizeTask};
use crate::model::VerificationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Other branches are still running.
    Pending { remaining: usize },
    /// This arrival completed the set.
    Released(FinalizeTask),
    /// The branch had already arrived for this run.
    Duplicate,
    /// Not part of the run's branch set, or the run was already released.
    Unknown,
}

#[derive(Debug)]
struct JoinState {
    expected: HashSet<BranchId>,
    arrived: HashSet<BranchId>,
    finalize: FinalizeTask,
}

#[derive(Debug, Default)]
pub struct JoinRegistry {
    joins: Mutex<HashMap<VerificationId, JoinState>>,
}

impl JoinRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<VerificationId, JoinState>> {
        self.joins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the barrier for `id`. With no branches there is nothing to wait
    /// for and the continuation is returned immediately.
    pub fn register(
        &self,
        id: VerificationId,
        branches: impl IntoIterator<Item = BranchId>,
        finalize: FinalizeTask,
    ) -> Option<FinalizeTask> {
        let expected: HashSet<BranchId> = branches.into_iter().collect();
        if expected.is_empty() {
            return Some(finalize);
        }
        self.lock().insert(
            id,
            JoinState {
                expected,
                arrived: HashSet::new(),
                finalize,
            },
        );
        None
    }

    pub fn arrive(&self, id: VerificationId, branch: BranchId) -> Arrival {
        let mut joins = self.lock();
        let Some(state) = joins.get_mut(&id) else {
            return Arrival::Unknown;
        };
        if !state.expected.contains(branch) {
            return Arrival::Unknown;
        }
        if !state.arrived.insert(branch) {
            return Arrival::Duplicate;
        }

        let remaining = state.expected.len() - state.arrived.len();
        if remaining > 0 {
            return Arrival::Pending { remaining };
        }
        match joins.remove(&id) {
            Some(state) => Arrival::Released(state.finalize),
            None => Arrival::Unknown,
        }
    }

    /// Runs still waiting on at least one branch.
    #[must_use]
    pub fn open(&self) -> usize {
        self.lock().len()
    }
}
