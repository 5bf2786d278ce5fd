use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::inference::InferenceService;
use crate::{api, form};

#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<InferenceService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // HTML form
        .merge(form::router())
        // JSON API
        .merge(api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}
