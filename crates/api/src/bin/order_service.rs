use anyhow::Context;
use orderflow_api::app::services;
use orderflow_infra::OrderServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init("order-service");

    let config = OrderServiceConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        strategy = ?config.adjust_strategy,
        inventory = %config.inventory_service_url,
        "starting order service"
    );
    let runtime = services::build_order_service(&config)
        .await
        .context("failed to start order service")?;

    let listener = tokio::net::TcpListener::bind(config.common.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.common.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "order service listening");

    axum::serve(listener, runtime.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    runtime.shutdown().await;
    tracing::info!("order service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
