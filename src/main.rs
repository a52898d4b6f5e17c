//! modelrelay - main entry point.
//!
//! Loads the routing document, builds the HTTP server, and runs it. A
//! config that fails validation aborts startup with a non-zero exit.

use anyhow::{Context, Result};
use chrono::Local;
use modelrelay::{router, AppState, ConfigStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time formatter using the local timezone (respects TZ).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any environment variables.
    dotenvy::dotenv().ok();

    // Always suppress noisy HTTP library logs regardless of RUST_LOG,
    // otherwise a plain RUST_LOG=debug lets hyper's per-chunk logs through.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,modelrelay=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{base_filter},hyper=warn,h2=warn,reqwest=warn"
    ));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
        .init();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = ConfigStore::load(&config_path)
        .with_context(|| format!("failed to load routing config from {config_path}"))?;

    let snapshot = config.snapshot();
    tracing::info!(
        providers = snapshot.api_provider.len(),
        models = snapshot.model_config.len(),
        "routing config loaded from {config_path}"
    );

    let state = Arc::new(AppState::new(Arc::new(config)));
    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8100);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("starting modelrelay on {addr}");
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Admin API: /admin/*, usage: /api_usage");
    tracing::info!("Swagger UI: /swagger-ui");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
