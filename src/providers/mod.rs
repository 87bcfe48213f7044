//! Adapters for the external verification providers.
//!
//! Every adapter takes an injected [`reqwest::Client`] and base URL so tests
//! can point it at a local mock server.

pub mod gris;
pub mod incandescent;
pub mod izitru;
pub mod tineye;
pub(crate) mod transcode;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::Value;

use crate::error::ProviderError;
use crate::model::{CorrelationToken, OriginalImage, ProviderResult};
use crate::util::text::truncate_error_message;

pub use gris::GrisProvider;
pub use incandescent::IncandescentProvider;
pub use izitru::IzitruProvider;
pub use tineye::TinEyeProvider;

/// One piece of source data a provider may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderInput {
    FileName,
    Image,
    ImageUrl,
}

/// Everything known about an item's original image, shared by all branches.
#[derive(Clone)]
pub struct SourceImage {
    pub file_name: String,
    pub href: String,
    pub bytes: Arc<[u8]>,
}

impl SourceImage {
    pub fn new(file_name: impl Into<String>, original: OriginalImage) -> Self {
        Self {
            file_name: file_name.into(),
            href: original.href,
            bytes: original.bytes.into(),
        }
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("file_name", &self.file_name)
            .field("href", &self.href)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// The subset of [`SourceImage`] a provider declared through
/// [`SyncProvider::inputs`].
#[derive(Clone, Default)]
pub struct ProviderArgs {
    file_name: Option<String>,
    image: Option<Arc<[u8]>>,
    image_url: Option<String>,
}

impl ProviderArgs {
    #[must_use]
    pub fn select(source: &SourceImage, inputs: &[ProviderInput]) -> Self {
        let mut args = Self::default();
        for input in inputs {
            match input {
                ProviderInput::FileName => args.file_name = Some(source.file_name.clone()),
                ProviderInput::Image => args.image = Some(Arc::clone(&source.bytes)),
                ProviderInput::ImageUrl => args.image_url = Some(source.href.clone()),
            }
        }
        args
    }

    pub fn file_name(&self, provider: &'static str) -> Result<&str, ProviderError> {
        self.file_name
            .as_deref()
            .ok_or_else(|| ProviderError::invalid_input(provider, "file name was not provided"))
    }

    pub fn image(&self, provider: &'static str) -> Result<&[u8], ProviderError> {
        match self.image.as_deref() {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            Some(_) => Err(ProviderError::invalid_input(provider, "image is empty")),
            None => Err(ProviderError::invalid_input(provider, "image was not provided")),
        }
    }

    pub fn image_url(&self, provider: &'static str) -> Result<&str, ProviderError> {
        self.image_url
            .as_deref()
            .ok_or_else(|| ProviderError::invalid_input(provider, "image URL was not provided"))
    }
}

impl fmt::Debug for ProviderArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderArgs")
            .field("file_name", &self.file_name)
            .field("image_len", &self.image.as_ref().map(|bytes| bytes.len()))
            .field("image_url", &self.image_url)
            .finish()
    }
}

/// Request/response provider.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn inputs(&self) -> &'static [ProviderInput];

    async fn invoke(&self, args: &ProviderArgs) -> Result<ProviderResult, ProviderError>;
}

/// Two-phase provider: submit an image URL, later resolve the returned token.
#[async_trait]
pub trait AsyncProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, image_url: &str) -> Result<CorrelationToken, ProviderError>;

    /// `Err(ProviderError::NotReady)` while the provider is still working.
    async fn resolve(&self, token: &CorrelationToken) -> Result<ProviderResult, ProviderError>;
}

/// Timeouts shared by every provider HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            total_timeout: Duration::from_secs(60),
        }
    }
}

/// Builds the HTTP client shared by the provider adapters.
pub fn build_http_client(settings: HttpSettings) -> Result<Client> {
    Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.total_timeout)
        .user_agent(concat!("verify-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build provider HTTP client")
}

/// Parses a configured base URL, making sure relative joins keep its path.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid provider URL {raw:?}"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn endpoint(
    provider: &'static str,
    base: &Url,
    path: &str,
) -> Result<Url, ProviderError> {
    base.join(path)
        .map_err(|e| ProviderError::graceful(provider, format!("invalid endpoint {path}: {e}")))
}

pub(crate) fn transport_error(provider: &'static str, error: &reqwest::Error) -> ProviderError {
    ProviderError::graceful(provider, format!("request failed: {error}"))
}

/// Reads a JSON body, turning non-2xx statuses and unparseable bodies into
/// graceful failures.
pub(crate) async fn read_json(
    provider: &'static str,
    response: Response,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, &e))?;

    if !status.is_success() {
        return Err(ProviderError::graceful(
            provider,
            format!("status {status}: {}", truncate_error_message(&body)),
        ));
    }

    serde_json::from_str(&body).map_err(|e| {
        ProviderError::graceful(
            provider,
            format!("invalid JSON ({e}): {}", truncate_error_message(&body)),
        )
    })
}

/// Reads a count that providers send either as a number or a numeric string.
pub(crate) fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
