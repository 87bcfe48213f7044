//! Error taxonomy shared by providers, stores and the sweep.

use thiserror::Error;

use crate::model::ItemId;

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport error, non-2xx status or unexpected response shape. Retryable.
    #[error("{provider} API failure: {message}")]
    Graceful {
        provider: &'static str,
        message: String,
    },
    /// The asynchronous provider has not finished processing the submission yet.
    #[error("{provider} result is not ready yet")]
    NotReady { provider: &'static str },
    /// The request can never succeed with this input.
    #[error("{provider} rejected input: {message}")]
    InvalidInput {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn graceful(provider: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Graceful {
            provider,
            message: message.to_string(),
        }
    }

    pub fn invalid_input(provider: &'static str, message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            provider,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Graceful { .. } | Self::NotReady { .. })
    }
}

/// Failure reported by a storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Contention, pool exhaustion or a dropped connection. Retryable.
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    /// One stored document does not decode. The rest of a scan is unaffected.
    #[error("ingest item {id} is malformed: {reason}")]
    MalformedItem { id: String, reason: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Failure scoped to a single item rather than the whole query.
    #[must_use]
    pub fn is_item_level(&self) -> bool {
        matches!(self, Self::MalformedItem { .. })
    }
}

/// Failure to resolve the original image bytes of an item.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("no original rendition registered for item {0}")]
    ImageNotFound(ItemId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure that aborts a whole verification sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("destination desk {0:?} not found")]
    DeskNotFound(String),
    #[error("a verification sweep is already running")]
    AlreadyRunning,
    #[error("ingest store query failed: {0}")]
    Store(#[from] StoreError),
}
