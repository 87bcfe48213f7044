//! Incandescent: asynchronous reverse image search.
//!
//! `submit` registers the image URL and returns the project id as the
//! correlation token. `resolve` reports [`ProviderError::NotReady`] until the
//! provider has crawled the web, then regroups the page-level matches by
//! source site and by normalized page URL.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::debug;

use super::{AsyncProvider, endpoint, parse_base_url, read_json, transport_error};
use crate::error::ProviderError;
use crate::model::{CorrelationToken, ProviderResult, Summary};
use crate::util::text::truncate_error_message;

const NAME: &str = "incandescent";
const EXPIRY_WINDOW_SECS: i64 = 1000;
const STATUS_NOT_READY: u64 = 710;
const STATUS_NO_RESULTS: u64 = 755;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct IncandescentProvider {
    client: Client,
    base_url: Url,
    uid: String,
    api_key: String,
    clock: fn() -> i64,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    uid: &'a str,
    expires: i64,
    auth: String,
    images: [&'a str; 1],
    multiple: u8,
}

#[derive(Debug, Serialize)]
struct GetRequest<'a> {
    uid: &'a str,
    expires: i64,
    auth: String,
    project_id: &'a str,
}

impl IncandescentProvider {
    pub fn new(
        client: Client,
        api_url: &str,
        uid: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: parse_base_url(api_url)?,
            uid: uid.into(),
            api_key: api_key.into(),
            clock: || Utc::now().timestamp(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    fn credentials(&self) -> Result<(i64, String), ProviderError> {
        let expires = (self.clock)() + EXPIRY_WINDOW_SECS;
        let auth = sign(&self.uid, &self.api_key, expires)?;
        Ok((expires, auth))
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, ProviderError> {
        let url = endpoint(NAME, &self.base_url, path)?;
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        let body = read_json(NAME, response).await?;
        if let Some(error) = body.get("error") {
            return Err(ProviderError::graceful(
                NAME,
                truncate_error_message(&error.to_string()),
            ));
        }
        Ok(body)
    }
}

/// Base64 HMAC-SHA256 of `"{uid}\n{expires}"` keyed with the API key.
fn sign(uid: &str, api_key: &str, expires: i64) -> Result<String, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|e| ProviderError::invalid_input(NAME, format!("unusable API key: {e}")))?;
    mac.update(format!("{uid}\n{expires}").as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Page URL without scheme, `www.` prefix, fragment or trailing slash, so the
/// same page reached through different links is counted once.
fn normalize_page_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.trim().trim_end_matches('/').to_string();
    };
    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    let port = url.port().map(|port| format!(":{port}")).unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    let query = url.query().map(|query| format!("?{query}")).unwrap_or_default();
    format!("{host}{port}{path}{query}")
}

fn page_source(page: &Map<String, Value>, normalized: &str) -> String {
    page.get("source")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map_or_else(
            || {
                normalized
                    .split(['/', ':', '?'])
                    .next()
                    .unwrap_or_default()
                    .to_string()
            },
            str::to_lowercase,
        )
}

/// Groups every page of every image entry as `source -> url -> [pages]`.
fn group_pages(body: &Map<String, Value>) -> BTreeMap<String, BTreeMap<String, Vec<Value>>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<Value>>> = BTreeMap::new();
    let pages = body
        .values()
        .filter_map(|entry| entry.get("pages").and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_object);

    for page in pages {
        let Some(raw_url) = page.get("page").and_then(Value::as_str) else {
            continue;
        };
        let normalized = normalize_page_url(raw_url);
        let source = page_source(page, &normalized);
        grouped
            .entry(source)
            .or_default()
            .entry(normalized)
            .or_default()
            .push(Value::Object(page.clone()));
    }
    grouped
}

fn parse_results(body: Value) -> Result<ProviderResult, ProviderError> {
    let Value::Object(map) = body else {
        return Err(ProviderError::graceful(NAME, "response is not an object"));
    };

    match map.get("status").and_then(Value::as_u64) {
        Some(STATUS_NOT_READY) => return Err(ProviderError::NotReady { provider: NAME }),
        Some(STATUS_NO_RESULTS) => {
            return Ok(ProviderResult::ok(
                Value::Object(Map::new()),
                Summary::PerSource(BTreeMap::new()),
            ));
        }
        Some(other) => {
            return Err(ProviderError::graceful(
                NAME,
                format!("unexpected status {other}"),
            ));
        }
        None => {}
    }

    let has_entries = map.values().any(|entry| entry.get("pages").is_some());
    if !has_entries {
        return Err(ProviderError::graceful(
            NAME,
            format!(
                "response has no result pages: {}",
                truncate_error_message(&Value::Object(map).to_string())
            ),
        ));
    }

    let grouped = group_pages(&map);
    let summary = grouped
        .iter()
        .map(|(source, urls)| (source.clone(), urls.len() as u64))
        .collect();
    let payload = serde_json::to_value(&grouped)
        .map_err(|e| ProviderError::graceful(NAME, format!("cannot encode results: {e}")))?;
    Ok(ProviderResult::ok(payload, Summary::PerSource(summary)))
}

#[async_trait]
impl AsyncProvider for IncandescentProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn submit(&self, image_url: &str) -> Result<CorrelationToken, ProviderError> {
        let (expires, auth) = self.credentials()?;
        let request = AddRequest {
            uid: &self.uid,
            expires,
            auth,
            images: [image_url],
            multiple: 1,
        };
        let body = self.post("add/", &request).await?;

        let token = match body.get("project_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(ProviderError::graceful(
                    NAME,
                    "response is missing `project_id`",
                ));
            }
        };
        debug!(provider = NAME, project_id = %token, "image submitted");
        Ok(CorrelationToken(token))
    }

    async fn resolve(&self, token: &CorrelationToken) -> Result<ProviderResult, ProviderError> {
        let (expires, auth) = self.credentials()?;
        let request = GetRequest {
            uid: &self.uid,
            expires,
            auth,
            project_id: &token.0,
        };
        let body = self.post("get/", &request).await?;
        parse_results(body)
    }
}
