use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use tracing::warn;

use crate::{app::AppState, error::SweepError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// POST /admin/sweep
/// 未検証の画像を一度だけスイープし、投入結果を返す
pub(crate) async fn run_sweep(State(state): State<AppState>) -> impl IntoResponse {
    state.telemetry().record_manual_sweep_invocation();
    match state.engine().verify_ingest().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => {
            warn!(error = %error, "manual verification sweep failed");
            let status = match error {
                SweepError::DeskNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
                SweepError::AlreadyRunning => StatusCode::CONFLICT,
                SweepError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(ErrorResponse {
                    error: error.to_string(),
                }),
            )
                .into_response()
        }
    }
}
