//! CSV API server

use anyhow::Context;
use clap::Parser;
use csv_api::config::Config;
use csv_api::ephemeral::EnginePool;
use csv_api::{api, durable, observability, TableService};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    observability::init_tracing();

    let config = Config::parse();
    let addr = config.bind_address()?;

    let store = durable::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open durable store {}", config.database_url))?;
    let pool = Arc::new(
        EnginePool::new(config.data_dir.clone())
            .with_context(|| format!("Failed to prepare data directory {}", config.data_dir.display()))?,
    );
    info!(store = store.name(), data_dir = %config.data_dir.display(), "Stores ready");

    let service = Arc::new(TableService::new(store, pool));
    let app = api::create_router(service.clone());

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, closing stores");
    service.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = until_signal("Ctrl-C", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = until_signal("SIGTERM", async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        signal.recv().await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Resolve when `signal` fires. A handler that cannot be installed never
/// resolves, so it cannot trigger a shutdown.
async fn until_signal(name: &str, signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        error!("Failed to listen for {}: {}", name, e);
        std::future::pending::<()>().await;
    }
}
