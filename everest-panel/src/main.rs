mod backend;
mod config;
mod daemon;
mod handlers;
mod routes;
mod services;
mod state;
mod store;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backend::BackupManager;
use config::PanelConfig;
use state::AppState;
use store::BackupStore;

const DEFAULT_CONFIG_PATH: &str = "panel.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("everest-panel starting");

    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = PanelConfig::load(&config_path)?;
    info!(path = %config_path.display(), "Configuration loaded");

    let store = BackupStore::open(&config.database_path, config.database_busy_timeout())?;

    let manager = Arc::new(BackupManager::from_config(&config)?);
    let state = Arc::new(AppState::new(store, manager));

    let app = routes::build_router(state).layer(TraceLayer::new_for_http());

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("everest-panel stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
