use std::sync::Arc;

use anyhow::Context;

use taskflow_api::app::{build_app, services::AppServices};
use taskflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    taskflow_api::init_logging();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(AppServices::from_config(&config).await?);

    let pool = if config.embedded_worker {
        let pool = services.worker_pool(config.worker.clone());
        taskflow_api::spawn_event_logger(pool.subscribe());
        Some(pool.spawn())
    } else {
        if !services.persistent {
            tracing::warn!("embedded worker disabled with in-memory stores; tasks will never run");
        }
        None
    };

    let app = build_app(services, &config.cors_origin);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        cors_origin = %config.cors_origin,
        persistent = config.use_persistent,
        embedded_worker = config.embedded_worker,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(taskflow_api::shutdown_signal())
        .await
        .context("server error")?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    Ok(())
}
