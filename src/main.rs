use anyhow::Result;
use round_robin_proxy::{DEFAULT_CONFIG_FILE, load_config, run};
use tracing::{error, info};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = load_config(&config_file)?;
    info!(
        config_file = %config_file,
        listen_addr = %config.listen_addr(),
        target_host = %config.target_host,
        target_ports = ?config.target_port,
        buffer_size = config.buffer_size,
        "Configuration loaded"
    );

    run(config, shutdown_signal()).await?;

    info!("Proxy server stopped");
    Ok(())
}
