use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "verify-worker";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// OTLP エクスポートの設定。エンドポイントが無ければエクスポートしない。
#[derive(Debug, Clone, PartialEq)]
struct OtlpSettings {
    endpoint: String,
    sampling_ratio: f64,
}

impl OtlpSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|value| !value.is_empty())?;
        let sampling_ratio = lookup("OTEL_SAMPLING_RATIO")
            .and_then(|raw| raw.parse::<f64>().ok())
            .map_or(1.0, |ratio| ratio.clamp(0.0, 1.0));
        Some(Self {
            endpoint,
            sampling_ratio,
        })
    }
}

/// JSON ログと (設定されていれば) OTLP スパン送信を一度だけ初期化する。
///
/// エクスポーターの構築に失敗してもログ出力だけで起動を続ける。
///
/// # Errors
/// グローバルサブスクライバが既に別の場所で設定されている場合。
pub fn init() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let settings = OtlpSettings::from_lookup(|key| std::env::var(key).ok());
        let export = settings.as_ref().map(|settings| {
            build_provider(settings).map(|provider| (settings.endpoint.clone(), provider))
        });

        let (otel_layer, failure) = match export {
            Some(Ok((endpoint, provider))) => {
                let tracer = provider.tracer(SERVICE_NAME);
                global::set_tracer_provider(provider.clone());
                let _ = TRACER_PROVIDER.set(provider);
                (
                    Some((endpoint, tracing_opentelemetry::layer().with_tracer(tracer))),
                    None,
                )
            }
            Some(Err(error)) => (None, Some(error)),
            None => (None, None),
        };
        let endpoint = otel_layer.as_ref().map(|(endpoint, _)| endpoint.clone());

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .with(otel_layer.map(|(_, layer)| layer))
            .try_init()
            .map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))?;

        match (endpoint, failure) {
            (Some(endpoint), _) => info!(otel_enabled = true, %endpoint, "tracing initialized"),
            (None, Some(error)) => {
                warn!(otel_enabled = false, error = %error, "OTLP exporter unavailable, logging only");
            }
            (None, None) => info!(otel_enabled = false, "tracing initialized"),
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

fn build_provider(settings: &OtlpSettings) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.endpoint.as_str())
        .build()
        .context("failed to build OTLP span exporter")?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            settings.sampling_ratio,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(
            Resource::builder()
                .with_attributes([
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])
                .build(),
        )
        .build())
}

/// バッチに残っているスパンを送信してエクスポーターを閉じる。
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(error) = provider.shutdown() {
            eprintln!("failed to flush OTLP spans: {error}");
        }
    }
}
