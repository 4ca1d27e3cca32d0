//! Wiring of the shared service handles.
//!
//! The embedding client, vector index, job store, outbox and notifier are
//! built once here and passed by `Arc` into the ingestor and retriever, so
//! tests can substitute any of them through [`Services::from_parts`].

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_client, EmbeddingClient};
use crate::index::{create_index, VectorIndex};
use crate::ingest::Ingestor;
use crate::jobs::JobStore;
use crate::migrate;
use crate::notify::{create_notifier, Outbox, StatusNotifier};
use crate::retrieve::Retriever;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub index: Arc<dyn VectorIndex>,
    pub jobs: JobStore,
    pub outbox: Outbox,
    pub notifier: Arc<dyn StatusNotifier>,
    pub ingestor: Arc<Ingestor>,
    pub retriever: Arc<Retriever>,
}

impl Services {
    /// Connect to the database, apply migrations and build the configured
    /// embedding provider, index backend and notifier.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder = create_client(&config.embedding).context("Failed to create embedding client")?;
        let index = create_index(&config, &pool);
        let notifier = create_notifier(&config.notify).context("Failed to create status notifier")?;
        Ok(Self::from_parts(config, pool, embedder, index, notifier))
    }

    pub fn from_parts(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        let config = Arc::new(config);
        let jobs = JobStore::new(pool.clone(), config.jobs.lease_secs);
        let outbox = Outbox::new(pool.clone(), config.notify.clone());
        let ingestor = Arc::new(Ingestor::new(
            config.clone(),
            embedder.clone(),
            index.clone(),
            jobs.clone(),
            outbox.clone(),
        ));
        let retriever = Arc::new(Retriever::new(config.clone(), embedder, index.clone()));
        Self {
            config,
            pool,
            index,
            jobs,
            outbox,
            notifier,
            ingestor,
            retriever,
        }
    }
}
