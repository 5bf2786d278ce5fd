use serde::Serialize;

use crate::summary::SummaryResult;

#[derive(Debug, Serialize)]
pub struct SummarizeResponse {
    #[serde(flatten)]
    pub result: SummaryResult,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
    pub model_loaded: bool,
}
