//! Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_int_gauge_with_registry,
};

/// プロバイダー呼び出しの結果ラベル。
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_RETRY: &str = "retry";
pub const OUTCOME_ERROR: &str = "error";

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub sweeps_total: Counter,
    pub sweeps_failed: Counter,
    pub items_dispatched: Counter,
    pub items_skipped_no_original: Counter,
    pub provider_calls: CounterVec,
    pub resolve_polls: Counter,
    pub finalizations: Counter,
    pub store_write_retries: CounterVec,
    pub store_write_abandoned: CounterVec,

    // ヒストグラム
    pub provider_latency: HistogramVec,

    // ゲージ
    pub pending_tasks: IntGauge,
    pub open_joins: IntGauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成し、`registry` に登録する。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            sweeps_total: register_counter_with_registry!(
                "verify_sweeps_total",
                "Total number of verification sweeps started",
                registry
            )?,
            sweeps_failed: register_counter_with_registry!(
                "verify_sweeps_failed_total",
                "Total number of verification sweeps aborted by a fatal error",
                registry
            )?,
            items_dispatched: register_counter_with_registry!(
                "verify_items_dispatched_total",
                "Total number of items fanned out to providers",
                registry
            )?,
            items_skipped_no_original: register_counter_with_registry!(
                "verify_items_skipped_no_original_total",
                "Total number of items skipped because no original rendition exists",
                registry
            )?,
            provider_calls: register_counter_vec_with_registry!(
                Opts::new(
                    "verify_provider_calls_total",
                    "Provider calls by provider and outcome"
                ),
                &["provider", "outcome"],
                registry
            )?,
            resolve_polls: register_counter_with_registry!(
                "verify_async_resolve_polls_total",
                "Total number of asynchronous resolve polls",
                registry
            )?,
            finalizations: register_counter_with_registry!(
                "verify_finalizations_total",
                "Total number of finalizer executions",
                registry
            )?,
            store_write_retries: register_counter_vec_with_registry!(
                Opts::new(
                    "verify_store_write_retries_total",
                    "Store writes retried after a transient failure"
                ),
                &["operation"],
                registry
            )?,
            store_write_abandoned: register_counter_vec_with_registry!(
                Opts::new(
                    "verify_store_write_abandoned_total",
                    "Store writes abandoned after exhausting retries or on a permanent error"
                ),
                &["operation"],
                registry
            )?,
            provider_latency: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "verify_provider_latency_seconds",
                    "Latency of a single provider call"
                )
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                &["provider"],
                registry
            )?,
            pending_tasks: register_int_gauge_with_registry!(
                "verify_pending_tasks",
                "Tasks queued, delayed or running",
                registry
            )?,
            open_joins: register_int_gauge_with_registry!(
                "verify_open_joins",
                "Verification runs waiting for provider branches",
                registry
            )?,
        })
    }

    pub fn record_provider_call(&self, provider: &str, outcome: &str) {
        self.provider_calls
            .with_label_values(&[provider, outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn registers_every_family_once() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).expect("metrics register");
        metrics.record_provider_call("tineye", OUTCOME_OK);
        metrics.store_write_retries.with_label_values(&["patch_item"]).inc();
        metrics.provider_latency.with_label_values(&["tineye"]).observe(0.2);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .expect("encode");
        let rendered = String::from_utf8(buffer).expect("utf8");

        assert!(rendered.contains("verify_provider_calls_total{"));
        assert!(rendered.contains(r#"provider="tineye""#));
        assert!(rendered.contains("verify_store_write_retries_total"));
        assert!(rendered.contains("verify_sweeps_total 0"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        Metrics::new(&registry).expect("first registration");
        assert!(Metrics::new(&registry).is_err());
    }
}
