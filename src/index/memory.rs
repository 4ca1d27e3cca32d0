//! In-memory [`VectorIndex`] for tests and single-process deployments.
//!
//! Collections are immutable `Arc`s in a map behind `tokio::sync::RwLock`.
//! A rebuild prepares the new `Arc` without holding the lock and then swaps
//! the map entry, so queries clone whichever `Arc` is current and rank it
//! lock-free. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_query_dims, fingerprint, rank, validate_chunks, CollectionInfo, Metric, VectorIndex};
use crate::error::RagError;
use crate::models::{collection_name, EmbeddedChunk, ScoredChunk};

struct Collection {
    info: CollectionInfo,
    entries: Vec<EmbeddedChunk>,
}

pub struct MemoryIndex {
    dims: usize,
    metric: Metric,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    generation: AtomicI64,
}

impl MemoryIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            collections: RwLock::new(HashMap::new()),
            generation: AtomicI64::new(0),
        }
    }

    async fn current(&self, agent_name: &str) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .await
            .get(&collection_name(agent_name))
            .cloned()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn rebuild(
        &self,
        agent_name: &str,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<CollectionInfo, RagError> {
        validate_chunks(&chunks, self.dims)?;

        let name = collection_name(agent_name);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = CollectionInfo {
            physical: format!("{}__g{}", name, generation),
            name: name.clone(),
            generation,
            size: chunks.len(),
            dims: self.dims,
            fingerprint: fingerprint(&chunks),
            created_at: chrono::Utc::now(),
        };
        let collection = Arc::new(Collection {
            info: info.clone(),
            entries: chunks,
        });

        self.collections.write().await.insert(name, collection);
        Ok(info)
    }

    async fn query(
        &self,
        agent_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        check_query_dims(vector, self.dims)?;
        Ok(match self.current(agent_name).await {
            Some(collection) => rank(&collection.entries, vector, top_k, self.metric),
            None => Vec::new(),
        })
    }

    async fn delete(&self, agent_name: &str) -> Result<bool, RagError> {
        Ok(self
            .collections
            .write()
            .await
            .remove(&collection_name(agent_name))
            .is_some())
    }

    async fn info(&self, agent_name: &str) -> Result<Option<CollectionInfo>, RagError> {
        Ok(self.current(agent_name).await.map(|c| c.info.clone()))
    }
}
