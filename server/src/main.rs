use std::net::SocketAddr;

use server::{build_router, AppState, ServerConfig};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting speech relay server...");

    let config = ServerConfig::from_env()?;
    info!(
        "Server configuration loaded: port={}, mode={:?}, model={}, queue_max_bytes={}",
        config.port, config.mode, config.default_model, config.queue_max_bytes
    );

    let port = config.port;
    let state = AppState::new(config);
    let registry = state.registry.clone();
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by the server; release their
            // provider connections here.
            let closed = registry.close_all().await;
            info!(closed, "Shutting down; active sessions closed");
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
