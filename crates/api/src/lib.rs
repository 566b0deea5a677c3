//! HTTP API: server, routing, and request/response mapping.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use taskflow_infra::jobs::QueueEvent;

pub mod app;

/// Initialize logging; `LOG_FORMAT=pretty` switches from JSON to plain text.
pub fn init_logging() {
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => taskflow_observability::init_pretty(),
        _ => taskflow_observability::init(),
    }
}

/// Resolves on Ctrl-C (and SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Log every queue outcome published by a worker pool.
pub fn spawn_event_logger(mut events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Completed { job_id, task_id, attempt }) => {
                    tracing::info!(%job_id, %task_id, attempt, "job completed");
                }
                Ok(QueueEvent::RetryScheduled { job_id, task_id, next_attempt, delay, error }) => {
                    tracing::info!(
                        %job_id,
                        %task_id,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "job failed; retry scheduled"
                    );
                }
                Ok(QueueEvent::Exhausted { job_id, task_id, attempts, error }) => {
                    tracing::warn!(%job_id, %task_id, attempts, %error, "job failed permanently");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "queue event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
