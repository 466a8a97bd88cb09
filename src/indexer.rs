//! Offline index build pipeline.
//!
//! ```text
//! corpus dir ──▶ load_corpus ──▶ chunk_document ──▶ embed_texts ──▶ VectorIndex::build ──▶ persist
//! ```
//!
//! Rebuilding is explicit and out-of-band: nothing on the request path
//! calls [`rebuild`]. Concurrent rebuilds of the same artifact are refused
//! through an exclusive lock file next to it, and publication is atomic
//! (see [`persist`](crate::persist)).

use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chunk::{chunk_document, ChunkPolicy};
use crate::config::Config;
use crate::corpus::load_corpus;
use crate::embedding::{embed_texts, Embedder};
use crate::error::{Error, Result};
use crate::index::{ChunkingParams, DocumentInfo, EmbeddedChunk, IndexParams, IndexTag, VectorIndex};
use crate::models::Document;
use crate::persist;

/// Summary of a completed build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildStats {
    pub documents: usize,
    pub chunks: usize,
    pub model_version: String,
    pub path: PathBuf,
}

/// The tag parameters an index must carry to be usable with `config`.
pub fn expected_params(config: &Config, embedder: &dyn Embedder) -> IndexParams {
    IndexParams {
        model_version: embedder.model_version().to_string(),
        dims: embedder.dims(),
        metric: config.index.metric,
        chunking: ChunkingParams::from(&config.chunking),
    }
}

/// Chunk and embed `documents` into an in-memory index.
pub async fn build_from_documents(
    documents: &[Document],
    params: IndexParams,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<VectorIndex> {
    if embedder.model_version() != params.model_version {
        return Err(Error::MixedModelVersions {
            expected: params.model_version,
            found: embedder.model_version().to_string(),
        });
    }

    let policy = ChunkPolicy::new(params.chunking.max_tokens, params.chunking.overlap_tokens);
    let chunks: Vec<_> = documents
        .iter()
        .flat_map(|doc| chunk_document(doc, policy))
        .collect();
    debug!(documents = documents.len(), chunks = chunks.len(), "chunked corpus");

    let mut embedded = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_texts(embedder, &texts).await?;
        for (chunk, vector) in batch.iter().zip(vectors) {
            embedded.push(EmbeddedChunk {
                chunk: chunk.clone(),
                model_version: embedder.model_version().to_string(),
                vector,
            });
        }
    }

    let infos = documents
        .iter()
        .map(|d| DocumentInfo {
            id: d.id.clone(),
            title: d.title.clone(),
            source: d.source.clone(),
            revision: d.revision.clone(),
        })
        .collect();

    VectorIndex::build(
        IndexTag {
            params,
            built_at: Utc::now(),
        },
        infos,
        embedded,
    )
}

/// Build the index from the configured corpus and publish it.
pub async fn rebuild(config: &Config, embedder: &dyn Embedder) -> Result<(VectorIndex, BuildStats)> {
    let _lock = BuildLock::acquire(&config.index.path)?;

    let documents = load_corpus(&config.corpus)?;
    info!(
        documents = documents.len(),
        dir = %config.corpus.dir.display(),
        "loaded reference corpus"
    );

    let index = build_from_documents(
        &documents,
        expected_params(config, embedder),
        embedder,
        config.embedding.batch_size,
    )
    .await?;
    persist::persist(&index, &config.index.path).await?;

    let stats = BuildStats {
        documents: documents.len(),
        chunks: index.len(),
        model_version: index.tag().params.model_version.clone(),
        path: config.index.path.clone(),
    };
    Ok((index, stats))
}

/// Load the published index, validating it against the active configuration.
pub async fn load_index(config: &Config, embedder: &dyn Embedder) -> Result<VectorIndex> {
    persist::load(&config.index.path, &expected_params(config, embedder)).await
}

/// Exclusive marker preventing two builds from publishing the same artifact.
struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    fn acquire(artifact: &Path) -> Result<Self> {
        let mut name = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let path = artifact.with_file_name(name);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::Config(format!(
                "another index build holds {}; remove it if no build is running",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
