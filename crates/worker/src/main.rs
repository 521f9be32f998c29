use std::sync::Arc;

use mailpulse_infra::config::WorkerConfig;
use mailpulse_infra::mail::LoggingMailSender;
use mailpulse_worker::{Backend, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailpulse_observability::init();

    let config = WorkerConfig::from_env()?;
    let backend = Backend::from_config(&config).await?;
    let worker = Worker::new(&config, backend, Arc::new(LoggingMailSender));

    tracing::info!(
        queues = ?config.queues,
        job_types = ?worker.job_types(),
        concurrency = config.concurrency,
        "worker starting"
    );
    let handle = worker.executor().spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let stats = handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        failed = stats.jobs_failed,
        "worker stopped"
    );
    Ok(())
}
