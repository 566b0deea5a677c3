//! Standalone worker process: drains the shared Redis queue into Postgres.

use anyhow::{Context, bail};

use taskflow_api::app::services::AppServices;
use taskflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    taskflow_api::init_logging();

    let config = AppConfig::from_env().context("invalid configuration")?;
    if !config.use_persistent {
        bail!("the standalone worker needs shared state; set USE_PERSISTENT_STORES=true");
    }

    let services = AppServices::persistent(&config).await?;
    let pool = services.worker_pool(config.worker.clone().with_name("taskflow-worker"));
    let logger = taskflow_api::spawn_event_logger(pool.subscribe());
    let handle = pool.spawn();

    tracing::info!(
        concurrency = config.worker.concurrency,
        "worker listening for tasks"
    );

    taskflow_api::shutdown_signal().await;
    tracing::info!("shutting down gracefully");

    let stats = handle.shutdown().await;
    logger.abort();
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        "worker stopped"
    );
    Ok(())
}
