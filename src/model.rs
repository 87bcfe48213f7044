//! Domain types shared between the engine, the stores and the provider adapters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Rendition key under which the ingested bytes are registered.
pub const ORIGINAL_RENDITION: &str = "original";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationId(pub Uuid);

impl VerificationId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeskId(pub String);

impl DeskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Picture,
    Text,
    Video,
    Audio,
    Composite,
    #[serde(other)]
    Other,
}

impl ItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Picture => "picture",
            ItemKind::Text => "text",
            ItemKind::Video => "video",
            ItemKind::Audio => "audio",
            ItemKind::Composite => "composite",
            ItemKind::Other => "other",
        }
    }
}

/// A stored rendition: `media` is the blob key, `href` its public URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendition {
    pub href: String,
    pub media: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    InProgress,
    Completed,
}

impl VerificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::InProgress => "in_progress",
            VerificationStatus::Completed => "completed",
        }
    }
}

/// The `verification` field of an ingest item.
///
/// `id` and `status` are written at dispatch time; every provider branch adds
/// its own summary key next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationState {
    pub id: VerificationId,
    pub status: VerificationStatus,
    #[serde(flatten)]
    pub summaries: BTreeMap<String, Value>,
}

impl VerificationState {
    #[must_use]
    pub fn started(id: VerificationId) -> Self {
        Self {
            id,
            status: VerificationStatus::InProgress,
            summaries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestItem {
    #[serde(rename = "_id", default)]
    pub id: ItemId,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slugline: Option<String>,
    #[serde(default)]
    pub renditions: BTreeMap<String, Rendition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationState>,
}

impl IngestItem {
    #[must_use]
    pub fn original_rendition(&self) -> Option<&Rendition> {
        self.renditions.get(ORIGINAL_RENDITION)
    }

    /// Name sent to providers that want one; falls back to the item id.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.slugline
            .as_deref()
            .filter(|slug| !slug.trim().is_empty())
            .unwrap_or(self.id.as_str())
    }
}

/// Original image bytes plus the public URL they are served from.
#[derive(Clone, PartialEq, Eq)]
pub struct OriginalImage {
    pub href: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for OriginalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalImage")
            .field("href", &self.href)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: VerificationId,
    pub results: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Ok,
    Error,
}

/// Item-level summary of one provider outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Summary {
    Count(u64),
    PerSource(BTreeMap<String, u64>),
}

/// Normalized outcome of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub status: ProviderStatus,
    pub payload: Value,
    pub summary: Option<Summary>,
}

impl ProviderResult {
    #[must_use]
    pub fn ok(payload: Value, summary: Summary) -> Self {
        Self {
            status: ProviderStatus::Ok,
            payload,
            summary: Some(summary),
        }
    }

    /// Terminal failure entry; the item-level summary stays null.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ProviderStatus::Error,
            payload: json!({ "status": "error", "message": message }),
            summary: None,
        }
    }

    /// Terminal entry recorded once a branch has spent its retry budget.
    #[must_use]
    pub fn from_exhausted(error: &crate::error::ProviderError) -> Self {
        Self::error(error.to_string())
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ProviderStatus::Ok
    }

    /// Value written to `verification.<provider>` on the ingest item.
    #[must_use]
    pub fn item_value(&self) -> Value {
        match &self.summary {
            Some(summary) => serde_json::to_value(summary).unwrap_or(Value::Null),
            None => Value::Null,
        }
    }

    /// Value written to `<provider>` on the verification record.
    #[must_use]
    pub fn record_value(&self) -> Value {
        self.payload.clone()
    }
}

/// Opaque handle returned by an asynchronous provider's submit phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub String);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
