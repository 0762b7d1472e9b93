use anyhow::Context;
use orderflow_api::app::services;
use orderflow_infra::InventoryServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init("inventory-service");

    let config = InventoryServiceConfig::from_env().context("invalid configuration")?;
    let runtime = services::build_inventory_service(&config)
        .await
        .context("failed to start inventory service")?;

    let listener = tokio::net::TcpListener::bind(config.common.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.common.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "inventory service listening");

    axum::serve(listener, runtime.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    runtime.shutdown().await;
    tracing::info!("inventory service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
