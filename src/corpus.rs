//! Reference corpus loading.
//!
//! Walks the configured corpus directory, applies include/exclude globs,
//! and reads every matching file into a [`Document`]. Documents may start
//! with TOML front matter between `+++` lines:
//!
//! ```text
//! +++
//! title = "Infant formula feeding volumes"
//! source = "WHO"
//! revision = "2023-05"
//! +++
//! # Volumes by age
//! ...
//! ```
//!
//! Any unreadable or malformed file aborts the whole load; a partial corpus
//! is never returned.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::error::{Error, Result};
use crate::models::Document;

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    title: Option<String>,
    source: Option<String>,
    revision: Option<String>,
}

/// Load every matching document under `config.dir`, sorted by id.
pub fn load_corpus(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.dir;
    if !root.is_dir() {
        return Err(Error::Ingestion {
            path: root.clone(),
            reason: "corpus directory does not exist".to_string(),
        });
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut documents = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Ingestion {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let raw = std::fs::read_to_string(path).map_err(|e| Error::Ingestion {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let doc = parse_document(&rel_str, path, &raw)?;
        debug!(id = %doc.id, title = %doc.title, "loaded reference document");
        documents.push(doc);
    }

    if documents.is_empty() {
        return Err(Error::EmptyCorpus(root.clone()));
    }

    // Tie-breaks in retrieval rely on a stable document order.
    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(documents)
}

/// Parse one file's contents into a [`Document`].
pub fn parse_document(id: &str, path: &Path, raw: &str) -> Result<Document> {
    let (front, body) = split_front_matter(raw).map_err(|reason| Error::Ingestion {
        path: path.to_path_buf(),
        reason,
    })?;

    if body.trim().is_empty() {
        return Err(Error::Ingestion {
            path: path.to_path_buf(),
            reason: "document body is empty".to_string(),
        });
    }

    let title = front
        .title
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| id.to_string())
        });

    let revision = front.revision.unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    });

    Ok(Document {
        id: id.to_string(),
        title,
        source: front.source.unwrap_or_else(|| "unknown".to_string()),
        body: body.to_string(),
        revision,
    })
}

fn split_front_matter(raw: &str) -> std::result::Result<(FrontMatter, &str), String> {
    let Some(rest) = raw
        .strip_prefix("+++\n")
        .or_else(|| raw.strip_prefix("+++\r\n"))
    else {
        return Ok((FrontMatter::default(), raw));
    };

    let Some(end) = rest.find("\n+++") else {
        return Err("unterminated front matter".to_string());
    };

    let front: FrontMatter =
        toml::from_str(&rest[..end]).map_err(|e| format!("invalid front matter: {}", e))?;

    let after = &rest[end + "\n+++".len()..];
    let body = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))
        .unwrap_or(after);
    Ok((front, body))
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).map_err(|e| Error::Config(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("bad glob set: {}", e)))
}
