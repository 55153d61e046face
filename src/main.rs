mod archive;
mod capture;
mod config;
mod error;
mod gemini;
mod live;
mod models;
mod routes;
mod session;
mod storyboard;
mod style;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    config::Config,
    gemini::{GeminiClient, GenerationService},
    routes::{router, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    let service = match &config.api_key {
        Some(key) => {
            tracing::info!("Using API key: {}...", key.chars().take(4).collect::<String>());
            Some(Arc::new(GeminiClient::new(key.clone(), &config)) as Arc<dyn GenerationService>)
        }
        None => {
            tracing::warn!("⚠️ GEMINI_API_KEY not set; waiting for PUT /api/credential");
            None
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config, service));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(%addr, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
