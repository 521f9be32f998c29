//! Worker process wiring: backends, handlers and the executor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use mailpulse_infra::automation::{self, AutomationEngine, RunnerRegistry};
use mailpulse_infra::broadcast::{self, BroadcastScheduler};
use mailpulse_infra::config::WorkerConfig;
use mailpulse_infra::jobs::{InMemoryJobStore, JobExecutor, JobRegistry, JobStore, PostgresJobStore};
use mailpulse_infra::mail::MailSender;
use mailpulse_infra::store::{self, InMemoryMarketingStore, PostgresMarketingStore, Stores};

/// Where jobs and marketing data live.
#[derive(Clone)]
pub struct Backend {
    pub stores: Stores,
    pub jobs: Arc<dyn JobStore>,
}

impl Backend {
    pub fn in_memory(store: Arc<InMemoryMarketingStore>) -> Self {
        Self {
            stores: Stores::shared(store),
            jobs: InMemoryJobStore::arc(),
        }
    }

    /// Connect, create missing tables and use Postgres for everything.
    pub async fn postgres(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        store::migrate(&pool).await.context("failed to migrate schema")?;

        Ok(Self {
            stores: Stores::shared(Arc::new(PostgresMarketingStore::new(pool.clone()))),
            jobs: Arc::new(PostgresJobStore::new(pool)),
        })
    }

    /// Postgres when the config names a database, in-memory otherwise.
    pub async fn from_config(config: &WorkerConfig) -> anyhow::Result<Self> {
        match &config.database_url {
            Some(url) => Self::postgres(url, config.db_max_connections).await,
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory stores");
                Ok(Self::in_memory(Arc::new(InMemoryMarketingStore::new())))
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

/// Handlers for every job type, registered once at startup.
#[derive(Clone)]
pub struct Worker {
    engine: Arc<AutomationEngine>,
    scheduler: Arc<BroadcastScheduler>,
    registry: Arc<JobRegistry>,
    jobs: Arc<dyn JobStore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: &WorkerConfig, backend: Backend, mail: Arc<dyn MailSender>) -> Self {
        let Backend { stores, jobs } = backend;

        let engine = Arc::new(AutomationEngine::new(
            stores.clone(),
            jobs.clone(),
            mail.clone(),
            RunnerRegistry::with_builtins(),
            config.automation_settings(),
        ));
        let scheduler = Arc::new(BroadcastScheduler::new(
            stores,
            jobs.clone(),
            mail,
            config.broadcast_settings(),
        ));

        let mut registry = JobRegistry::new();
        automation::register(&mut registry, engine.clone(), config.job_type_options());
        broadcast::register(&mut registry, scheduler.clone(), config.job_type_options());

        Self {
            engine,
            scheduler,
            registry: Arc::new(registry),
            jobs,
            config: config.clone(),
        }
    }

    pub fn engine(&self) -> &Arc<AutomationEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<BroadcastScheduler> {
        &self.scheduler
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn job_types(&self) -> Vec<String> {
        self.registry.job_types()
    }

    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.jobs.clone(),
            self.registry.clone(),
            self.config.executor_config(),
        )
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
