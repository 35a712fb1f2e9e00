#![forbid(unsafe_code)]

use std::net::SocketAddr;

use checkview_adapter::{AdapterConfig, AdapterRuntime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AdapterConfig::from_env()?;
    let runtime = AdapterRuntime::from_config(&config)?;
    let cleanup = runtime.start_cleanup();

    info!(
        listen_addr = %config.bind,
        db = config.db_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".to_string()),
        cleanup_interval_ms = config.cleanup_interval_ms,
        cleanup = ?cleanup,
        "checkview_adapter_http listening"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let app = runtime
        .clone()
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.stop_cleanup();
    info!("checkview_adapter_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "ctrl-c handler failed; shutting down");
    }
}
