use axum::{
    routing::{get, post},
    Router,
};

use crate::app::AppState;

pub mod handlers;
pub mod types;

use handlers::{health, summarize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/summarize", post(summarize))
        .route("/health", get(health))
}
