use std::sync::Arc;

use bart_summarizer::app::{self, AppState};
use bart_summarizer::config::AppConfig;
use bart_summarizer::inference::InferenceService;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Config
    // -----------------------------
    // Loads .env first so RUST_LOG from it reaches the filter below.
    let config = AppConfig::from_env()?;

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.apply_process_env();

    println!("🚀 Starting summarization server...");
    info!(
        model = config.model_id.as_str(),
        threads = config.threads,
        local_snapshot = config.model_dir.is_some(),
        "configuration loaded"
    );

    // -----------------------------
    // Shared model handle
    // -----------------------------
    let infer = Arc::new(InferenceService::for_config(&config));
    if config.eager_load {
        // A failed warm-up is not fatal: the next submission retries and
        // shows the error on the page.
        if let Err(err) = infer.warm_up().await {
            error!("model warm-up failed: {err:#}");
        }
    }

    let app = app::router(AppState { infer });

    println!("🌐 HTTP listening on http://{}", config.addr);
    println!("🛠 JSON API at http://{}/api/summarize", config.addr);

    let listener = TcpListener::bind(&config.addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, releasing model");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
}
