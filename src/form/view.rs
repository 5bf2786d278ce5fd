use minijinja::{context, Environment};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{SummarizeError, REMEDIATION_HINT};
use crate::summary::{LengthBounds, SummaryResult, MAX_LENGTH_RANGE, MIN_LENGTH_RANGE};

const PAGE_TEMPLATE: &str = "index.html";

static TEMPLATES: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.add_template(
        PAGE_TEMPLATE,
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/index.html")),
    )
    .expect("invalid page template");
    env
});

/// What the page shows under the form.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Idle,
    Warning { message: String },
    Error { message: String, hint: String },
    Summary { result: SummaryResult },
}

impl From<Result<SummaryResult, SummarizeError>> for Outcome {
    fn from(value: Result<SummaryResult, SummarizeError>) -> Self {
        match value {
            Ok(result) => Outcome::Summary { result },
            Err(err @ SummarizeError::EmptyInput) => Outcome::Warning {
                message: err.to_string(),
            },
            Err(err @ SummarizeError::AdapterFailure(_)) => Outcome::Error {
                message: err.to_string(),
                hint: REMEDIATION_HINT.to_string(),
            },
        }
    }
}

/// Everything the page renders from. Rebuilt for every request.
#[derive(Debug, Clone, Serialize)]
pub struct ViewModel {
    pub current_input: String,
    pub max_length: u32,
    pub min_length: u32,
    pub max_range: (u32, u32),
    pub min_range: (u32, u32),
    pub model_id: String,
    pub outcome: Outcome,
}

impl ViewModel {
    pub fn new(model_id: &str, current_input: String, bounds: LengthBounds) -> Self {
        Self {
            current_input,
            max_length: bounds.max_length,
            min_length: bounds.min_length,
            max_range: MAX_LENGTH_RANGE,
            min_range: MIN_LENGTH_RANGE,
            model_id: model_id.to_string(),
            outcome: Outcome::Idle,
        }
    }

    pub fn with_outcome(mut self, outcome: impl Into<Outcome>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn render(&self) -> Result<String, minijinja::Error> {
        TEMPLATES
            .get_template(PAGE_TEMPLATE)?
            .render(context! { view => self })
    }
}
