use msg_gateway::config::{ensure_config_dir, load_config};
use msg_gateway::create_backend;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    ensure_config_dir();
    let config = load_config();
    let flush_interval = Duration::from_secs(config.spool.flush_interval_secs.max(1));

    let backend = Arc::new(create_backend(config).await?);
    let worker = backend.start_spool_worker(flush_interval);
    info!("spool worker replaying from {}", backend.spool_dir().display());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    worker.abort();
    Ok(())
}
