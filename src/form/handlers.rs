use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use tracing::{debug, error};

use super::example::EXAMPLE_TEXT;
use super::view::ViewModel;
use crate::app::AppState;
use crate::summary::{LengthBounds, SummaryRequest};

pub async fn index(State(state): State<AppState>) -> Response {
    let view = ViewModel::new(state.infer.model_id(), String::new(), LengthBounds::default());
    render(&view)
}

/// Runs one submission and renders whatever it ended in. Failures become
/// part of the page; the form stays usable either way.
pub async fn summarize(
    State(state): State<AppState>,
    Form(req): Form<SummaryRequest>,
) -> Response {
    let bounds = req.bounds();
    debug!(
        chars = req.input_text.chars().count(),
        max_length = bounds.max_length,
        min_length = bounds.min_length,
        "form submission"
    );

    let outcome = state.infer.summarize(&req).await;
    let view = ViewModel::new(state.infer.model_id(), req.input_text, bounds).with_outcome(outcome);
    render(&view)
}

/// Replaces the input with the example passage, keeping the slider values.
pub async fn use_example(
    State(state): State<AppState>,
    Form(req): Form<SummaryRequest>,
) -> Response {
    let view = ViewModel::new(state.infer.model_id(), EXAMPLE_TEXT.to_string(), req.bounds());
    render(&view)
}

fn render(view: &ViewModel) -> Response {
    match view.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!("page rendering failed: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "page rendering failed").into_response()
        }
    }
}
