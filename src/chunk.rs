//! Overlapping token-window chunker.
//!
//! Splits document text into windows of at most `chunk_size` tokens, each
//! starting `chunk_size - overlap` tokens after the previous one. A token
//! is a maximal run of non-whitespace characters. Windows ignore sentence
//! and paragraph boundaries, which keeps the output deterministic: the same
//! text and parameters always produce the same chunks.
//!
//! Chunk text is sliced from the source between the first and last token of
//! the window, so the original spacing inside a chunk is preserved.

use crate::error::RagError;
use crate::models::Chunk;

/// Validated chunking parameters. `overlap < chunk_size` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkParams {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, RagError> {
        if chunk_size == 0 {
            return Err(RagError::Validation("chunking.chunk_size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(RagError::Validation(format!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Tokens between the starts of consecutive windows. Never zero.
    pub fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Byte spans of the whitespace-delimited tokens in `text`.
pub fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Split `text` into overlapping token windows.
///
/// Empty (or all-whitespace) text yields no chunks; text of at most
/// `chunk_size` tokens yields exactly one.
pub fn chunk_text(text: &str, params: ChunkParams) -> Vec<Chunk> {
    let spans = token_spans(text);
    let total = spans.len();
    let mut chunks = Vec::new();
    if total == 0 {
        return chunks;
    }

    let mut start = 0usize;
    loop {
        let end = (start + params.chunk_size).min(total);
        let byte_start = spans[start].0;
        let byte_end = spans[end - 1].1;
        chunks.push(Chunk {
            ordinal: chunks.len(),
            text: text[byte_start..byte_end].to_string(),
            token_count: end - start,
            token_start: start,
        });
        if end == total {
            break;
        }
        start += params.step();
    }

    chunks
}
