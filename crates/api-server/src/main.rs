//! Conductor server
//!
//! REST API and server-sent log streams over the execution manager.

mod config;
mod routes;
mod state;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "conductor_server=debug,agent_runner=debug,git_worktree=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        "Using data directory {:?}, repository {:?}",
        config.data_dir,
        config.repo_path
    );

    let app_state = AppState::new(config.clone())
        .await
        .context("Failed to initialize application state")?;

    // Records left Running by a previous process have no live child any more
    match app_state.manager().recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("Marked {} interrupted executions as failed", n),
        Err(e) => tracing::error!("Failed to recover interrupted executions: {}", e),
    }

    spawn_cleanup(app_state.clone(), config.cleanup_interval);

    let app = routes::router()
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!("REST API listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Periodically remove containers of attempts idle past the TTL
fn spawn_cleanup(state: AppState, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.manager().cleanup_expired().await {
                Ok(0) => tracing::debug!("No expired containers"),
                Ok(n) => tracing::info!("Removed {} expired containers", n),
                Err(e) => tracing::error!("Expired container cleanup failed: {}", e),
            }
        }
    });
}
