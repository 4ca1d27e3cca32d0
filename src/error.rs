//! Error taxonomy shared by the ingestion and retrieval pipeline.
//!
//! Library code returns [`RagError`]; the binary and configuration layers
//! wrap it in `anyhow` like the rest of the CLI. The HTTP server maps each
//! variant onto a status code in [`crate::server`].

use std::fmt;

use thiserror::Error;

/// Pipeline stage at which an ingestion attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Load,
    Chunk,
    Embed,
    Rebuild,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Load => "load",
            IngestStage::Chunk => "chunk",
            IngestStage::Embed => "embed",
            IngestStage::Rebuild => "rebuild",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("ingestion of agent '{agent}' failed during {stage}: {message}")]
    PartialIngestionFailure {
        agent: String,
        stage: IngestStage,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// True for failures caused by the embedding service or the vector store.
    pub fn is_upstream(&self) -> bool {
        match self {
            RagError::EmbeddingUnavailable(_)
            | RagError::UpstreamUnavailable(_)
            | RagError::Storage(_) => true,
            RagError::PartialIngestionFailure { .. } => true,
            _ => false,
        }
    }

    /// Wrap a failure from one ingestion stage. `NotFound` and `Validation`
    /// pass through untouched so callers can still tell them apart.
    pub fn at_stage(self, agent: &str, stage: IngestStage) -> RagError {
        match self {
            RagError::NotFound(_) | RagError::Validation(_) => self,
            RagError::PartialIngestionFailure { .. } => self,
            other => RagError::PartialIngestionFailure {
                agent: agent.to_string(),
                stage,
                message: other.to_string(),
            },
        }
    }
}

/// Bound an external call by `secs` seconds, reporting expiry as
/// [`RagError::UpstreamUnavailable`].
pub async fn with_timeout<T, F>(secs: u64, what: &str, fut: F) -> Result<T, RagError>
where
    F: std::future::Future<Output = Result<T, RagError>>,
{
    match tokio::time::timeout(std::time::Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(RagError::UpstreamUnavailable(format!(
            "{} timed out after {}s",
            what, secs
        ))),
    }
}
