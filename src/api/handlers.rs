use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::types::{ErrorResponse, HealthResponse, SummarizeResponse};
use crate::app::AppState;
use crate::error::SummarizeError;
use crate::summary::SummaryRequest;

pub async fn summarize(
    State(state): State<AppState>,
    Json(req): Json<SummaryRequest>,
) -> Response {
    match state.infer.summarize(&req).await {
        Ok(result) => Json(SummarizeResponse {
            result,
            generated_at: chrono::Utc::now(),
        })
        .into_response(),
        Err(err) => {
            let status = match err {
                SummarizeError::EmptyInput => StatusCode::UNPROCESSABLE_ENTITY,
                SummarizeError::AdapterFailure(_) => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(ErrorResponse {
                    error: err.code(),
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.infer.model_id().to_string(),
        model_loaded: state.infer.is_loaded(),
    })
}
