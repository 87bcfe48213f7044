//! TinEye reverse image searchアダプター。
//!
//! 画像本体をmultipartでアップロードし、一致件数をサマリーとして返します。
use anyhow::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::debug;

use super::{
    ProviderArgs, ProviderInput, SyncProvider, endpoint, parse_base_url, read_json,
    transport_error,
};
use crate::error::ProviderError;
use crate::model::{ProviderResult, Summary};

const NAME: &str = "tineye";
const UPLOAD_FILE_NAME: &str = "image.jpg";

#[derive(Debug, Clone)]
pub struct TinEyeProvider {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl TinEyeProvider {
    pub fn new(client: Client, api_url: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client,
            base_url: parse_base_url(api_url)?,
            api_key: api_key.into(),
        })
    }
}

/// レスポンスを検証し、一致件数を取り出す。
///
/// `code` が無い、または200以外の場合はgraceful failureとする。
fn parse_search(body: Value) -> Result<ProviderResult, ProviderError> {
    let code = body
        .get("code")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProviderError::graceful(NAME, "response is missing `code`"))?;
    if code != 200 {
        let messages = body.get("messages").cloned().unwrap_or(Value::Null);
        return Err(ProviderError::graceful(
            NAME,
            format!("search failed with code {code}: {messages}"),
        ));
    }

    let results = body
        .get("results")
        .filter(|results| results.is_object())
        .ok_or_else(|| ProviderError::graceful(NAME, "response is missing `results`"))?;
    let count = results
        .get("total_results")
        .and_then(super::as_count)
        .or_else(|| {
            results
                .get("matches")
                .and_then(Value::as_array)
                .map(|matches| matches.len() as u64)
        })
        .ok_or_else(|| ProviderError::graceful(NAME, "response has no match count"))?;

    Ok(ProviderResult::ok(body, Summary::Count(count)))
}

#[async_trait]
impl SyncProvider for TinEyeProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn inputs(&self) -> &'static [ProviderInput] {
        &[ProviderInput::Image]
    }

    async fn invoke(&self, args: &ProviderArgs) -> Result<ProviderResult, ProviderError> {
        let image = args.image(NAME)?;
        let url = endpoint(NAME, &self.base_url, "search/")?;
        debug!(provider = NAME, bytes = image.len(), "uploading image for search");

        let part = Part::bytes(image.to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str("image/jpeg")
            .map_err(|e| transport_error(NAME, &e))?;
        let form = Form::new().part("image_upload", part);

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;

        let body = read_json(NAME, response).await?;
        parse_search(body)
    }
}
