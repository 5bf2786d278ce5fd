use axum::{
    routing::{get, post},
    Router,
};

use crate::app::AppState;

pub mod example;
pub mod handlers;
pub mod view;

use handlers::{index, summarize, use_example};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/summarize", post(summarize))
        .route("/example", post(use_example))
}
