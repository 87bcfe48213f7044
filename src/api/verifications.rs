use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::{app::AppState, model::VerificationId};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// GET /v1/verifications/{id}
pub(crate) async fn get_verification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine().verification(VerificationId(id)).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("verification {id} not found"),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(verification_id = %id, error = %e, "failed to read verification record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to read verification record".to_string(),
                }),
            )
                .into_response()
        }
    }
}
