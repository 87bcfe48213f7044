use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::task::BranchId;
use crate::providers::{AsyncProvider, SyncProvider};
use crate::util::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider {0} is already registered")]
    Duplicate(&'static str),
    #[error("asynchronous provider {existing} is already registered, cannot add {new}")]
    AsyncAlreadyRegistered {
        existing: &'static str,
        new: &'static str,
    },
}

#[derive(Clone)]
pub struct SyncEntry {
    pub adapter: Arc<dyn SyncProvider>,
    pub policy: RetryPolicy,
}

#[derive(Clone)]
pub struct AsyncEntry {
    pub adapter: Arc<dyn AsyncProvider>,
    pub submit_policy: RetryPolicy,
    pub resolve_policy: RetryPolicy,
}

/// Provider adapters and their retry policies, fixed at construction time.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    sync: BTreeMap<&'static str, SyncEntry>,
    asynchronous: Option<AsyncEntry>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync(
        mut self,
        adapter: Arc<dyn SyncProvider>,
        policy: RetryPolicy,
    ) -> Result<Self, RegistryError> {
        let name = adapter.name();
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.sync.insert(name, SyncEntry { adapter, policy });
        Ok(self)
    }

    pub fn with_async(
        mut self,
        adapter: Arc<dyn AsyncProvider>,
        submit_policy: RetryPolicy,
        resolve_policy: RetryPolicy,
    ) -> Result<Self, RegistryError> {
        let name = adapter.name();
        if let Some(existing) = &self.asynchronous {
            return Err(RegistryError::AsyncAlreadyRegistered {
                existing: existing.adapter.name(),
                new: name,
            });
        }
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.asynchronous = Some(AsyncEntry {
            adapter,
            submit_policy,
            resolve_policy,
        });
        Ok(self)
    }

    fn contains(&self, name: &str) -> bool {
        self.sync.contains_key(name)
            || self
                .asynchronous
                .as_ref()
                .is_some_and(|entry| entry.adapter.name() == name)
    }

    #[must_use]
    pub fn sync(&self, name: &str) -> Option<&SyncEntry> {
        self.sync.get(name)
    }

    pub fn sync_entries(&self) -> impl Iterator<Item = &SyncEntry> {
        self.sync.values()
    }

    #[must_use]
    pub fn asynchronous(&self) -> Option<&AsyncEntry> {
        self.asynchronous.as_ref()
    }

    /// One branch per registered provider.
    #[must_use]
    pub fn branch_ids(&self) -> Vec<BranchId> {
        self.sync
            .keys()
            .copied()
            .chain(self.asynchronous.iter().map(|entry| entry.adapter.name()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sync.is_empty() && self.asynchronous.is_none()
    }
}
