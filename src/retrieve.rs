//! Retrieval: embed a prompt, query the agent's collection, flatten.

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{with_timeout, RagError};
use crate::index::VectorIndex;
use crate::models::{validate_agent_name, ScoredChunk};

pub struct Retriever {
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
        }
    }

    /// Chunk texts most similar to `prompt`, best first.
    ///
    /// `top_k` defaults to `retrieval.top_k`. An agent that has never
    /// completed an ingestion yields an empty list.
    pub async fn retrieve(
        &self,
        agent_name: &str,
        prompt: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<String>, RagError> {
        Ok(self
            .retrieve_scored(agent_name, prompt, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.text)
            .collect())
    }

    /// Like [`Retriever::retrieve`] but keeps ids and scores.
    pub async fn retrieve_scored(
        &self,
        agent_name: &str,
        prompt: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        validate_agent_name(agent_name)?;
        if prompt.trim().is_empty() {
            return Err(RagError::Validation("prompt must not be empty".into()));
        }
        let retrieval = &self.config.retrieval;
        let top_k = top_k.unwrap_or(retrieval.top_k);
        if top_k > retrieval.max_top_k {
            return Err(RagError::Validation(format!(
                "top_k must be at most {}",
                retrieval.max_top_k
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let index_timeout = self.config.index.timeout_secs;
        let info = with_timeout(index_timeout, "collection lookup", self.index.info(agent_name)).await?;
        if info.is_none() {
            tracing::debug!(agent = %agent_name, "no collection yet, retrieval is empty");
            return Ok(Vec::new());
        }

        let vector = with_timeout(
            self.config.embedding.timeout_secs,
            "prompt embedding",
            self.embedder.embed(prompt),
        )
        .await?;
        let hits = with_timeout(
            index_timeout,
            "index query",
            self.index.query(agent_name, &vector, top_k),
        )
        .await?;
        tracing::debug!(agent = %agent_name, top_k, hits = hits.len(), "retrieved");
        Ok(hits)
    }
}
