//! Google reverse image search through the Custom Search JSON API.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use super::{ProviderArgs, ProviderInput, SyncProvider, as_count, read_json, transport_error};
use crate::error::ProviderError;
use crate::model::{ProviderResult, Summary};
use crate::util::text::truncate_error_message;

const NAME: &str = "gris";
pub const DEFAULT_API_URL: &str = "https://www.googleapis.com/customsearch/v1";

#[derive(Debug, Clone)]
pub struct GrisProvider {
    client: Client,
    endpoint: Url,
    api_key: String,
    cx: String,
}

impl GrisProvider {
    pub fn new(
        client: Client,
        api_url: &str,
        api_key: impl Into<String>,
        cx: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: Url::parse(api_url)?,
            api_key: api_key.into(),
            cx: cx.into(),
        })
    }
}

fn parse_search(body: Value) -> Result<ProviderResult, ProviderError> {
    if let Some(error) = body.get("error") {
        return Err(ProviderError::graceful(
            NAME,
            truncate_error_message(&error.to_string()),
        ));
    }
    let count = body
        .pointer("/searchInformation/totalResults")
        .and_then(as_count)
        .ok_or_else(|| {
            ProviderError::graceful(NAME, "response is missing searchInformation.totalResults")
        })?;
    Ok(ProviderResult::ok(body, Summary::Count(count)))
}

#[async_trait]
impl SyncProvider for GrisProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn inputs(&self) -> &'static [ProviderInput] {
        &[ProviderInput::ImageUrl]
    }

    async fn invoke(&self, args: &ProviderArgs) -> Result<ProviderResult, ProviderError> {
        let href = args.image_url(NAME)?;

        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", href),
                ("searchType", "image"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;

        // Quota and key errors come back as non-2xx with an `error` object.
        let body = read_json(NAME, response).await?;
        parse_search(body)
    }
}
