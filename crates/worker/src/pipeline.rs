//! Wiring of store, sandbox, orchestrator and service from configuration.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use folio_infra::jobs::{
    ArtifactHandoff, InMemoryJobStore, JobService, JobStore, Orchestrator, PostgresJobStore,
};
use folio_infra::sandbox::ProcessSandbox;
use folio_infra::storage::ArtifactStorage;
use folio_infra::PipelineConfig;

pub struct Pipeline {
    pub store: Arc<dyn JobStore>,
    pub storage: ArtifactStorage,
    pub orchestrator: Arc<Orchestrator>,
    pub service: JobService,
}

impl Pipeline {
    pub async fn connect(config: &PipelineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn JobStore> = match &config.database_url {
            Some(url) => {
                let pool = PgPool::connect(url)
                    .await
                    .context("connecting to the job database")?;
                let store = PostgresJobStore::new(pool);
                store.ensure_schema().await.context("preparing job schema")?;
                info!("using postgres job store");
                Arc::new(store)
            }
            None => {
                info!("using in-memory job store");
                InMemoryJobStore::arc()
            }
        };

        let storage = ArtifactStorage::new(&config.storage_root);
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox.clone(), storage.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            sandbox,
            ArtifactHandoff::new(storage.clone()),
            config.limits,
        ));
        let service = JobService::new(Arc::clone(&store), Arc::clone(&orchestrator));

        Ok(Self {
            store,
            storage,
            orchestrator,
            service,
        })
    }
}
