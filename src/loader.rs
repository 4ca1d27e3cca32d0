//! Reads an agent's document directory.
//!
//! Walks `<agents.dir>/<agent_name>/` recursively, applies the configured
//! include/exclude globs, and returns one [`Document`] per readable file,
//! sorted by relative path so repeated loads of unchanged files produce the
//! same sequence. Files that cannot be decoded are skipped with a warning.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::AgentsConfig;
use crate::error::RagError;
use crate::extract::{content_type_for, extract_text, is_binary_format};
use crate::models::{validate_agent_name, Document};

/// Resolve the agent's directory, failing with `NotFound` if it is absent.
pub fn agent_dir(config: &AgentsConfig, agent_name: &str) -> Result<PathBuf, RagError> {
    validate_agent_name(agent_name)?;
    let dir = config.agent_dir(agent_name);
    if !dir.is_dir() {
        return Err(RagError::NotFound(format!(
            "Directory for agent {} not found",
            agent_name
        )));
    }
    Ok(dir)
}

pub fn load_agent_documents(
    config: &AgentsConfig,
    agent_name: &str,
) -> Result<Vec<Document>, RagError> {
    let root = agent_dir(config, agent_name)?;

    let include_set = build_globset(&config.include_globs)?;
    let mut default_excludes = vec!["**/.*".to_string(), "**/.*/**".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    let walker = WalkDir::new(&root)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(agent = %agent_name, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        if let Some(doc) = read_document(path, &rel_str, agent_name)? {
            documents.push(doc);
        }
    }

    documents.sort_by(|a, b| a.filename.cmp(&b.filename));
    tracing::debug!(agent = %agent_name, documents = documents.len(), "loaded documents");
    Ok(documents)
}

/// `Ok(None)` means the file was skipped.
fn read_document(path: &Path, filename: &str, agent_name: &str) -> Result<Option<Document>, RagError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(agent = %agent_name, file = %filename, error = %e, "skipping unreadable document");
            return Ok(None);
        }
    };
    let content_type = content_type_for(filename);

    let text = if is_binary_format(content_type) {
        match extract_text(&bytes, content_type) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(agent = %agent_name, file = %filename, error = %e, "skipping document");
                return Ok(None);
            }
        }
    } else {
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                tracing::warn!(agent = %agent_name, file = %filename, "skipping non UTF-8 document");
                return Ok(None);
            }
        }
    };

    Ok(Some(Document {
        agent_name: agent_name.to_string(),
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        text,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, RagError> {
    let invalid = |e: globset::Error| RagError::Validation(format!("invalid glob: {}", e));
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(invalid)?);
    }
    builder.build().map_err(invalid)
}
