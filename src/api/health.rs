use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum ProbeStatus {
    Ready,
    Degraded,
    Live,
}

/// プローブ応答。ready のときだけ未処理タスク数を含める。
#[derive(Debug, Serialize)]
pub(crate) struct HealthReport {
    status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl HealthReport {
    fn bare(status: ProbeStatus) -> Self {
        Self {
            status,
            pending_tasks: None,
            detail: None,
        }
    }
}

pub(crate) async fn ready(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    state.telemetry().record_ready_probe();
    let pending_tasks = Some(state.queue().pending());

    match state.health().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthReport {
                pending_tasks,
                ..HealthReport::bare(ProbeStatus::Ready)
            }),
        ),
        Err(error) => {
            error!(%error, "verify_db readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthReport {
                    pending_tasks,
                    detail: Some(format!("verify_db: {error}")),
                    ..HealthReport::bare(ProbeStatus::Degraded)
                }),
            )
        }
    }
}

pub(crate) async fn live(State(state): State<AppState>) -> Json<HealthReport> {
    state.telemetry().record_live_probe();
    Json(HealthReport::bare(ProbeStatus::Live))
}
