pub mod bart;
pub mod engine;
pub mod generation;
pub mod loader;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::SummarizeError;
use crate::summary::{LengthBounds, SummaryRequest, SummaryResult};

use engine::BartSummarizer;

/// One generated summary, as the pretrained pipeline reports it.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub summary_text: String,
    pub input_tokens: usize,
    pub truncated: bool,
}

/// A loaded summarization capability. Calls block until the model is done.
pub trait SummaryEngine: Send + Sync {
    fn summarize(&self, text: &str, bounds: &LengthBounds) -> anyhow::Result<Vec<SummaryRecord>>;
}

type EngineFuture = Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn SummaryEngine>>> + Send>>;
type EngineInit = Arc<dyn Fn() -> EngineFuture + Send + Sync>;

/// Owns the single engine handle shared by every request.
///
/// The engine is built once and reused. A failed initialization leaves the
/// slot empty, so the next request tries again and reports its own failure.
pub struct InferenceService {
    model_id: String,
    engine: OnceCell<Arc<dyn SummaryEngine>>,
    init: EngineInit,
}

impl InferenceService {
    pub fn new<F, Fut>(model_id: impl Into<String>, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn SummaryEngine>>> + Send + 'static,
    {
        Self {
            model_id: model_id.into(),
            engine: OnceCell::new(),
            init: Arc::new(move || Box::pin(init()) as EngineFuture),
        }
    }

    /// Service around an engine that is already loaded.
    pub fn with_engine(model_id: impl Into<String>, engine: Arc<dyn SummaryEngine>) -> Self {
        let loaded = engine.clone();
        Self {
            model_id: model_id.into(),
            engine: OnceCell::new_with(Some(loaded)),
            init: Arc::new(move || {
                let engine = engine.clone();
                Box::pin(async move { Ok::<_, anyhow::Error>(engine) }) as EngineFuture
            }),
        }
    }

    /// Production service: BART weights from the configured snapshot.
    pub fn for_config(cfg: &AppConfig) -> Self {
        let cfg = cfg.clone();
        Self::new(cfg.model_id.clone(), move || {
            let cfg = cfg.clone();
            async move {
                let engine = BartSummarizer::load(&cfg).await?;
                Ok(Arc::new(engine) as Arc<dyn SummaryEngine>)
            }
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.initialized()
    }

    async fn engine(&self) -> anyhow::Result<Arc<dyn SummaryEngine>> {
        let engine = self
            .engine
            .get_or_try_init(|| {
                info!(model = self.model_id.as_str(), "initializing summarization model");
                (self.init)()
            })
            .await?;
        Ok(engine.clone())
    }

    /// Loads the model ahead of the first request.
    pub async fn warm_up(&self) -> anyhow::Result<()> {
        self.engine().await.map(|_| ())
    }

    /// Validates, runs the engine off the async runtime and derives the
    /// statistics. Every fault comes back as a [`SummarizeError`].
    pub async fn summarize(&self, req: &SummaryRequest) -> Result<SummaryResult, SummarizeError> {
        req.validate()?;
        let bounds = req.bounds();
        let request_id = Uuid::new_v4();
        if bounds.is_inverted() {
            warn!(
                %request_id,
                min_length = bounds.min_length,
                max_length = bounds.max_length,
                "min_length exceeds max_length, forwarding as-is"
            );
        }

        let engine = self.engine().await.map_err(|err| {
            error!(%request_id, "model initialization failed: {err:#}");
            SummarizeError::from_chain(&err)
        })?;

        let text = req.input_text.clone();
        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || engine.summarize(&text, &bounds)).await;
        let elapsed = started.elapsed();

        let records = match joined {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                error!(%request_id, "summarization failed: {err:#}");
                return Err(SummarizeError::from_chain(&err));
            }
            Err(join_err) => {
                error!(%request_id, "summarization task aborted: {join_err}");
                return Err(SummarizeError::adapter(format!(
                    "summarization task aborted: {join_err}"
                )));
            }
        };

        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| SummarizeError::adapter("the model returned no summary"))?;

        let mut result = SummaryResult::new(&req.input_text, record.summary_text);
        result.elapsed_ms = elapsed.as_millis() as u64;
        result.input_tokens = record.input_tokens;
        result.truncated = record.truncated;

        info!(
            %request_id,
            original_length = result.original_length,
            summary_length = result.summary_length,
            compression_percent = result.compression_percent,
            elapsed_ms = result.elapsed_ms,
            "summary generated"
        );
        Ok(result)
    }
}
