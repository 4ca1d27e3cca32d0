//! Core data types that flow through ingestion and retrieval.

use serde::Serialize;

use crate::error::RagError;

/// Raw text of one file in an agent's document directory.
#[derive(Debug, Clone)]
pub struct Document {
    pub agent_name: String,
    /// Path relative to the agent directory, `/`-separated.
    pub filename: String,
    pub content_type: String,
    pub text: String,
}

/// A token window cut from a document by [`crate::chunk::chunk_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    /// Index of the first token of this window in the document.
    pub token_start: usize,
}

/// The unit stored in a vector collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    /// Unique within one collection generation only.
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
}

/// A query hit, ranked by descending score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Public, stable name of an agent's collection.
pub fn collection_name(agent_name: &str) -> String {
    format!("agent_{}", agent_name)
}

/// Chunk id within one rebuild generation.
pub fn chunk_id(ordinal: usize) -> String {
    format!("doc_chunk_{}", ordinal)
}

/// Reject agent names that could escape the agents directory.
pub fn validate_agent_name(agent_name: &str) -> Result<(), RagError> {
    if agent_name.trim().is_empty() {
        return Err(RagError::Validation("agent_name must not be empty".into()));
    }
    if agent_name.contains('/')
        || agent_name.contains('\\')
        || agent_name.contains("..")
        || agent_name.starts_with('.')
        || agent_name.chars().any(char::is_control)
    {
        return Err(RagError::Validation(format!(
            "invalid agent_name: {:?}",
            agent_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(collection_name("bot1"), "agent_bot1");
        assert_eq!(chunk_id(7), "doc_chunk_7");
    }

    #[test]
    fn agent_name_validation() {
        assert!(validate_agent_name("bot1").is_ok());
        assert!(validate_agent_name("Support Bot").is_ok());
        assert!(validate_agent_name("").is_err());
        assert!(validate_agent_name("../etc").is_err());
        assert!(validate_agent_name("a/b").is_err());
        assert!(validate_agent_name(".hidden").is_err());
    }
}
