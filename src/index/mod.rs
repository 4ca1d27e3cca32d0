//! Per-agent vector collections.
//!
//! The [`VectorIndex`] trait is the seam between the pipeline and the
//! vector store. Each agent owns one logical collection named
//! `agent_<name>`; [`VectorIndex::rebuild`] replaces it wholesale and must
//! be atomic with respect to [`VectorIndex::query`]: a reader sees either
//! the complete old set or the complete new set, never an absent or
//! partially populated collection.
//!
//! | Backend | Swap mechanism |
//! |---------|----------------|
//! | [`SqliteIndex`] | shadow collection + alias repoint in one transaction |
//! | [`MemoryIndex`] | `Arc` pointer swap under a write lock |
//!
//! Ranking is shared by both backends through [`rank`]: scores under the
//! configured [`Metric`] in descending order, ties broken by insertion
//! order so results are reproducible.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{cosine_similarity, dot};
use crate::error::RagError;
use crate::models::{EmbeddedChunk, ScoredChunk};

/// Similarity metric used to rank query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine similarity; magnitude-independent.
    #[default]
    Cosine,
    /// Raw inner product; equals cosine for unit-length embeddings.
    Dot,
    /// Negated Euclidean distance, so larger is still more similar.
    Euclidean,
}

impl Metric {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot(a, b),
            Metric::Euclidean => {
                let d: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
                -d.sqrt()
            }
        }
    }
}

/// Metadata of the collection currently visible under an agent's alias.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    /// Stable public name, `agent_<name>`.
    pub name: String,
    /// Backend-specific name of the generation the alias points at.
    pub physical: String,
    pub generation: i64,
    pub size: usize,
    pub dims: usize,
    /// SHA-256 over the chunk texts; unchanged documents give the same value.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Atomically replace the agent's collection with `chunks`.
    async fn rebuild(
        &self,
        agent_name: &str,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<CollectionInfo, RagError>;

    /// Top-`top_k` entries by descending similarity. An agent without a
    /// collection yields an empty result, not an error.
    async fn query(
        &self,
        agent_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError>;

    /// Remove the collection permanently. Returns whether one existed.
    async fn delete(&self, agent_name: &str) -> Result<bool, RagError>;

    async fn info(&self, agent_name: &str) -> Result<Option<CollectionInfo>, RagError>;

    /// Drop generations no alias points at. Returns how many were removed.
    async fn collect_garbage(&self) -> Result<usize, RagError> {
        Ok(0)
    }
}

/// Build the configured backend.
pub fn create_index(config: &Config, pool: &SqlitePool) -> Arc<dyn VectorIndex> {
    let dims = config.embedding.dims;
    let metric = config.index.metric;
    match config.index.backend.as_str() {
        "memory" => Arc::new(MemoryIndex::new(dims, metric)),
        _ => Arc::new(SqliteIndex::new(pool.clone(), dims, metric)),
    }
}

/// Score every entry against `query` and keep the best `top_k`.
pub fn rank<'a, I>(entries: I, query: &[f32], top_k: usize, metric: Metric) -> Vec<ScoredChunk>
where
    I: IntoIterator<Item = &'a EmbeddedChunk>,
{
    if top_k == 0 {
        return Vec::new();
    }
    let entries: Vec<&EmbeddedChunk> = entries.into_iter().collect();
    let mut scored: Vec<(usize, f32)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (i, metric.score(query, &e.vector)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(top_k);
    scored
        .into_iter()
        .map(|(i, score)| ScoredChunk {
            id: entries[i].id.clone(),
            text: entries[i].text.clone(),
            score,
        })
        .collect()
}

/// Content fingerprint of a collection.
pub fn fingerprint(chunks: &[EmbeddedChunk]) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Dimensions must match the deployment and ids must be unique.
pub fn validate_chunks(chunks: &[EmbeddedChunk], dims: usize) -> Result<(), RagError> {
    let mut seen = HashSet::with_capacity(chunks.len());
    for c in chunks {
        if c.vector.len() != dims {
            return Err(RagError::Validation(format!(
                "chunk {} has {} dimensions, index expects {}",
                c.id,
                c.vector.len(),
                dims
            )));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(RagError::Validation(format!("duplicate chunk id: {}", c.id)));
        }
    }
    Ok(())
}

pub(crate) fn check_query_dims(vector: &[f32], dims: usize) -> Result<(), RagError> {
    if vector.len() != dims {
        return Err(RagError::Validation(format!(
            "query vector has {} dimensions, index expects {}",
            vector.len(),
            dims
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            id: id.to_string(),
            text: format!("text of {}", id),
            vector,
        }
    }

    #[test]
    fn rank_orders_by_descending_score() {
        let entries = vec![
            entry("a", vec![0.0, 1.0]),
            entry("b", vec![1.0, 0.0]),
            entry("c", vec![1.0, 1.0]),
        ];
        let hits = rank(&entries, &[1.0, 0.0], 5, Metric::Cosine);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn rank_breaks_ties_by_insertion_order() {
        let entries = vec![
            entry("first", vec![1.0, 0.0]),
            entry("other", vec![0.0, 1.0]),
            entry("second", vec![2.0, 0.0]),
            entry("third", vec![0.5, 0.0]),
        ];
        let hits = rank(&entries, &[1.0, 0.0], 3, Metric::Cosine);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn rank_truncates_and_handles_zero() {
        let entries: Vec<EmbeddedChunk> =
            (0..10).map(|i| entry(&i.to_string(), vec![i as f32, 1.0])).collect();
        assert_eq!(rank(&entries, &[1.0, 0.0], 4, Metric::Dot).len(), 4);
        assert!(rank(&entries, &[1.0, 0.0], 0, Metric::Dot).is_empty());
        assert_eq!(rank(&entries, &[1.0, 0.0], 50, Metric::Dot).len(), 10);
    }

    #[test]
    fn metrics_disagree_on_magnitude() {
        let entries = vec![entry("near", vec![1.0, 0.1]), entry("long", vec![10.0, 5.0])];
        let by_dot = rank(&entries, &[1.0, 0.0], 1, Metric::Dot);
        let by_cos = rank(&entries, &[1.0, 0.0], 1, Metric::Cosine);
        let by_l2 = rank(&entries, &[1.0, 0.0], 1, Metric::Euclidean);
        assert_eq!(by_dot[0].id, "long");
        assert_eq!(by_cos[0].id, "near");
        assert_eq!(by_l2[0].id, "near");
    }

    #[test]
    fn validation_checks_dims_and_ids() {
        let ok = vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])];
        assert!(validate_chunks(&ok, 2).is_ok());
        assert!(validate_chunks(&ok, 3).is_err());
        let dup = vec![entry("a", vec![1.0, 0.0]), entry("a", vec![0.0, 1.0])];
        assert!(validate_chunks(&dup, 2).is_err());
    }

    #[test]
    fn fingerprint_depends_on_text_only() {
        let a = vec![entry("a", vec![1.0])];
        let mut b = a.clone();
        b[0].vector = vec![2.0];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b[0].text.push('!');
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
