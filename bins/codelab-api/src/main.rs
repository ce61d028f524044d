mod handlers;
mod metrics;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use codelab_engine::config::ConfigLoader;
use codelab_engine::Grader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub grader: Grader,
}

fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/evaluate", post(handlers::evaluate))
        .route("/status", get(handlers::status))
        .route("/verdict/last", get(handlers::last_verdict))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_text))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .init();

    info!("codelab API booting...");

    let config = match std::env::var("CODELAB_CONFIG") {
        Ok(path) => ConfigLoader::load(Path::new(&path))?,
        Err(_) => ConfigLoader::load_default()?,
    };
    let config = ConfigLoader::apply_env(config)?;

    info!(
        sandbox_mode = %config.sandbox_mode,
        max_execution_time_ms = config.max_execution_time_ms,
        timeout_ms = config.timeout_ms,
        "Grader configured"
    );

    metrics::register().context("Failed to register metrics")?;

    let state = Arc::new(AppState {
        grader: Grader::new(config),
    });
    let app = routes(state);

    // Start server
    let addr = std::env::var("CODELAB_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to evaluate submissions");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
