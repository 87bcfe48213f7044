//! izitru画像フォレンジックアダプター。
//!
//! JPEG以外の入力はアップロード前にJPEGへ変換します (EXIFは保持)。
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::header::{EXPIRES, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::transcode::ensure_jpeg_owned;
use super::{ProviderArgs, ProviderInput, SyncProvider, as_count, read_json, transport_error};
use crate::error::ProviderError;
use crate::model::{ProviderResult, Summary};
use crate::util::text::truncate_error_message;

const NAME: &str = "izitru";

#[derive(Debug, Clone)]
pub struct IzitruProvider {
    client: Client,
    endpoint: Url,
    activation_key: String,
    private_key: String,
    clock: fn() -> i64,
}

impl IzitruProvider {
    pub fn new(
        client: Client,
        api_url: &str,
        activation_key: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: Url::parse(api_url)?,
            activation_key: activation_key.into(),
            private_key: private_key.into(),
            clock: || Utc::now().timestamp(),
        })
    }

    /// リクエスト時刻の取得方法を差し替える。
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }
}

/// `securityHash` は unix時刻の文字列と秘密鍵を連結したもののMD5。
fn security_hash(security_data: i64, private_key: &str) -> String {
    let mut context = md5::Context::new();
    context.consume(security_data.to_string().as_bytes());
    context.consume(private_key.as_bytes());
    format!("{:x}", context.compute())
}

fn parse_upload(body: Value) -> Result<ProviderResult, ProviderError> {
    let verdict = body.get("verdict").ok_or_else(|| {
        ProviderError::graceful(
            NAME,
            format!(
                "response is missing `verdict`: {}",
                truncate_error_message(&body.to_string())
            ),
        )
    })?;
    let count = as_count(verdict)
        .ok_or_else(|| ProviderError::graceful(NAME, format!("unexpected verdict {verdict}")))?;
    Ok(ProviderResult::ok(body, Summary::Count(count)))
}

#[async_trait]
impl SyncProvider for IzitruProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn inputs(&self) -> &'static [ProviderInput] {
        &[ProviderInput::FileName, ProviderInput::Image]
    }

    async fn invoke(&self, args: &ProviderArgs) -> Result<ProviderResult, ProviderError> {
        let file_name = args.file_name(NAME)?.to_string();
        let image = args.image(NAME)?;
        let upload = ensure_jpeg_owned(image.to_vec())
            .await
            .map_err(|e| ProviderError::graceful(NAME, format!("transcoding task failed: {e}")))?
            .map_err(|e| ProviderError::invalid_input(NAME, format!("cannot decode image: {e}")))?;
        debug!(provider = NAME, file_name = %file_name, bytes = upload.len(), "uploading image");

        let security_data = (self.clock)();
        let mut part_headers = HeaderMap::new();
        part_headers.insert(EXPIRES, HeaderValue::from_static("0"));
        let part = Part::bytes(upload)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(|e| transport_error(NAME, &e))?
            .headers(part_headers);
        let form = Form::new()
            .text("activationKey", self.activation_key.clone())
            .text("securityData", security_data.to_string())
            .text("securityHash", security_hash(security_data, &self.private_key))
            .text("exactMatch", "true")
            .text("nearMatch", "false")
            .text("storeImage", "true")
            .part("upFile", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::graceful(
                NAME,
                format!("status {status}: {}", truncate_error_message(&body)),
            ));
        }
        let body = read_json(NAME, response).await?;
        parse_upload(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OriginalImage;
    use crate::providers::SourceImage;
    use crate::providers::transcode::tests::png_bytes;
    use wiremock::matchers::{method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    const FIXTURE_OK: &str = include_str!("../../tests/fixtures/izitru_upload_ok.json");
    const FIXTURE_NO_VERDICT: &str =
        include_str!("../../tests/fixtures/izitru_upload_missing_verdict.json");

    fn provider(server: &MockServer) -> IzitruProvider {
        IzitruProvider::new(
            Client::new(),
            &format!("{}/scripts/uploadAPI.pl", server.uri()),
            "activation",
            "private-key",
        )
        .expect("provider should build")
        .with_clock(|| 1_446_026_578)
    }

    fn args(bytes: Vec<u8>) -> ProviderArgs {
        let source = SourceImage::new(
            "harbour-fire.png",
            OriginalImage {
                href: "http://cdn/1.png".to_string(),
                bytes,
            },
        );
        ProviderArgs::select(&source, &[ProviderInput::FileName, ProviderInput::Image])
    }

    #[test]
    fn security_hash_is_md5_of_time_and_key() {
        assert_eq!(
            security_hash(1_446_026_578, "private-key"),
            "b078a77d0fe89a4630617404e3ad9917"
        );
    }

    /// Multipart bodies carry raw JPEG bytes, so matching works on bytes.
    struct BodyContains(&'static [u8]);

    impl Match for BodyContains {
        fn matches(&self, request: &Request) -> bool {
            request
                .body
                .windows(self.0.len())
                .any(|window| window == self.0)
        }
    }

    #[tokio::test]
    async fn uploads_signed_jpeg_and_reads_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scripts/uploadAPI.pl"))
            .and(BodyContains(b"b078a77d0fe89a4630617404e3ad9917"))
            .and(BodyContains(b"1446026578"))
            .and(BodyContains(b"filename=\"harbour-fire.png\""))
            .and(BodyContains(b"image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIXTURE_OK))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server)
            .invoke(&args(png_bytes()))
            .await
            .expect("upload succeeds");

        assert_eq!(result.summary, Some(Summary::Count(3)));
        assert_eq!(result.payload["imageID"], "0c9ed2b6");
    }

    #[tokio::test]
    async fn expires_header_belongs_to_the_file_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(BodyContains(b"expires: 0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIXTURE_OK))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .invoke(&args(png_bytes()))
            .await
            .expect("upload succeeds");

        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get(EXPIRES).is_none());
    }

    #[tokio::test]
    async fn missing_verdict_is_graceful() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIXTURE_NO_VERDICT))
            .mount(&server)
            .await;

        let error = provider(&server).invoke(&args(png_bytes())).await.unwrap_err();

        assert!(error.is_transient());
        assert!(error.to_string().contains("verdict"));
    }

    #[tokio::test]
    async fn accepted_but_not_ok_is_graceful() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_body_string(FIXTURE_OK))
            .mount(&server)
            .await;

        let error = provider(&server).invoke(&args(png_bytes())).await.unwrap_err();

        assert!(error.to_string().contains("202"));
    }

    #[tokio::test]
    async fn undecodable_image_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIXTURE_OK))
            .expect(0)
            .mount(&server)
            .await;

        let error = provider(&server)
            .invoke(&args(b"not an image".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(error, ProviderError::InvalidInput { .. }));
    }
}
