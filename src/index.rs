//! Exact nearest-neighbor vector index.
//!
//! A [`VectorIndex`] owns every (chunk, vector) pair of one build plus the
//! [`IndexTag`] describing how it was produced. It is immutable once built
//! and is shared read-only (typically behind an `Arc`) by any number of
//! concurrent queries.
//!
//! Queries are a linear scan with the build's [`Metric`]. Results are
//! ordered by descending score; equal scores fall back to ascending
//! `(document id, ordinal)` so ranking is fully deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::ChunkingConfig;
use crate::embedding::{cosine_similarity, dot_product, validate_vector};
use crate::error::{Error, Result};
use crate::models::{Chunk, ScoredChunk};

/// Similarity metric, fixed per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
}

impl Metric {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::InnerProduct => dot_product(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "inner_product",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cosine" => Some(Metric::Cosine),
            "inner_product" => Some(Metric::InnerProduct),
            _ => None,
        }
    }
}

/// Everything that must match between an index artifact and the active
/// configuration for the artifact to be usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexParams {
    pub model_version: String,
    pub dims: usize,
    pub metric: Metric,
    pub chunking: ChunkingParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkingParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl From<&ChunkingConfig> for ChunkingParams {
    fn from(c: &ChunkingConfig) -> Self {
        Self {
            max_tokens: c.max_tokens,
            overlap_tokens: c.overlap_tokens,
        }
    }
}

impl IndexParams {
    /// Fail with [`Error::IndexMismatch`] on the first differing field.
    pub fn ensure_matches(&self, expected: &IndexParams) -> Result<()> {
        let checks: [(&'static str, String, String); 5] = [
            (
                "embedding model version",
                self.model_version.clone(),
                expected.model_version.clone(),
            ),
            ("dimensions", self.dims.to_string(), expected.dims.to_string()),
            (
                "metric",
                self.metric.as_str().to_string(),
                expected.metric.as_str().to_string(),
            ),
            (
                "chunking.max_tokens",
                self.chunking.max_tokens.to_string(),
                expected.chunking.max_tokens.to_string(),
            ),
            (
                "chunking.overlap_tokens",
                self.chunking.overlap_tokens.to_string(),
                expected.chunking.overlap_tokens.to_string(),
            ),
        ];
        for (field, stored, wanted) in checks {
            if stored != wanted {
                return Err(Error::IndexMismatch {
                    field,
                    stored,
                    expected: wanted,
                });
            }
        }
        Ok(())
    }
}

/// Provenance stamped on every index artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexTag {
    pub params: IndexParams,
    pub built_at: DateTime<Utc>,
}

/// Reference-document metadata kept alongside the vectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentInfo {
    pub id: String,
    pub title: String,
    pub source: String,
    pub revision: String,
}

/// A chunk with its vector, as produced by the embedding step.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub model_version: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    tag: IndexTag,
    documents: Vec<DocumentInfo>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Assemble an index, rejecting mixed model versions, bad vectors, and
    /// chunks whose document is unknown.
    pub fn build(
        tag: IndexTag,
        mut documents: Vec<DocumentInfo>,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<Self> {
        documents.sort_by(|a, b| a.id.cmp(&b.id));

        let mut entries = Vec::with_capacity(chunks.len());
        for embedded in chunks {
            if embedded.model_version != tag.params.model_version {
                return Err(Error::MixedModelVersions {
                    expected: tag.params.model_version.clone(),
                    found: embedded.model_version,
                });
            }
            validate_vector(&embedded.vector, tag.params.dims)?;
            if documents
                .binary_search_by(|d| d.id.as_str().cmp(&embedded.chunk.document_id))
                .is_err()
            {
                return Err(Error::Ingestion {
                    path: embedded.chunk.document_id.clone().into(),
                    reason: "chunk references a document missing from the build".to_string(),
                });
            }
            entries.push(IndexEntry {
                chunk: embedded.chunk,
                vector: embedded.vector,
            });
        }

        entries.sort_by(|a, b| chunk_order(&a.chunk, &b.chunk));
        Ok(Self {
            tag,
            documents,
            entries,
        })
    }

    /// Reassemble a previously persisted index without re-validating vectors.
    pub(crate) fn from_parts(
        tag: IndexTag,
        documents: Vec<DocumentInfo>,
        entries: Vec<IndexEntry>,
    ) -> Self {
        Self {
            tag,
            documents,
            entries,
        }
    }

    pub fn tag(&self) -> &IndexTag {
        &self.tag
    }

    pub fn documents(&self) -> &[DocumentInfo] {
        &self.documents
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn document(&self, id: &str) -> Option<&DocumentInfo> {
        self.documents
            .binary_search_by(|d| d.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.documents[i])
    }

    /// Top-`k` chunks by similarity to `vector`.
    ///
    /// An empty index yields an empty result, never an error.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.tag.params.dims {
            return Err(Error::DimensionMismatch {
                expected: self.tag.params.dims,
                actual: vector.len(),
            });
        }

        let metric = self.tag.params.metric;
        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|e| (metric.score(vector, &e.vector), e))
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| chunk_order(&a.chunk, &b.chunk))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| {
                let (title, source) = match self.document(&entry.chunk.document_id) {
                    Some(d) => (d.title.clone(), d.source.clone()),
                    None => (entry.chunk.document_id.clone(), "unknown".to_string()),
                };
                ScoredChunk {
                    chunk: entry.chunk.clone(),
                    document_title: title,
                    document_source: source,
                    score,
                }
            })
            .collect())
    }
}

fn chunk_order(a: &Chunk, b: &Chunk) -> Ordering {
    a.document_id
        .cmp(&b.document_id)
        .then(a.ordinal.cmp(&b.ordinal))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn params(dims: usize) -> IndexParams {
        IndexParams {
            model_version: "hash:test".to_string(),
            dims,
            metric: Metric::Cosine,
            chunking: ChunkingParams {
                max_tokens: 100,
                overlap_tokens: 10,
            },
        }
    }

    pub(crate) fn chunk(doc: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            document_id: doc.to_string(),
            ordinal,
            start: 0,
            end: text.len(),
            section: Some("Volumes".to_string()),
            text: text.to_string(),
            hash: String::new(),
        }
    }

    pub(crate) fn doc(id: &str) -> DocumentInfo {
        DocumentInfo {
            id: id.to_string(),
            title: format!("Title of {}", id),
            source: "WHO".to_string(),
            revision: "1".to_string(),
        }
    }

    fn embedded(doc: &str, ordinal: u32, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(doc, ordinal, "text"),
            model_version: "hash:test".to_string(),
            vector,
        }
    }

    pub(crate) fn sample_index() -> VectorIndex {
        VectorIndex::build(
            IndexTag {
                params: params(2),
                built_at: Utc::now(),
            },
            vec![doc("b.md"), doc("a.md")],
            vec![
                embedded("b.md", 0, vec![1.0, 0.0]),
                embedded("a.md", 1, vec![0.0, 1.0]),
                embedded("a.md", 0, vec![1.0, 0.0]),
                embedded("b.md", 1, vec![0.6, 0.8]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_query_orders_by_score_then_position() {
        let index = sample_index();
        let results = index.query(&[1.0, 0.0], 4).unwrap();
        let keys: Vec<_> = results
            .iter()
            .map(|r| (r.chunk.document_id.as_str(), r.chunk.ordinal))
            .collect();
        // a.md#0 and b.md#0 tie at 1.0; a.md sorts first.
        assert_eq!(keys, vec![("a.md", 0), ("b.md", 0), ("b.md", 1), ("a.md", 1)]);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(results[0].document_title, "Title of a.md");
    }

    #[test]
    fn test_query_respects_k() {
        let index = sample_index();
        assert_eq!(index.query(&[1.0, 0.0], 2).unwrap().len(), 2);
        assert_eq!(index.query(&[1.0, 0.0], 10).unwrap().len(), 4);
        assert!(index.query(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let index = VectorIndex::build(
            IndexTag {
                params: params(2),
                built_at: Utc::now(),
            },
            vec![],
            vec![],
        )
        .unwrap();
        assert!(index.is_empty());
        assert!(index.query(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn test_mixed_model_versions_rejected() {
        let mut other = embedded("a.md", 1, vec![0.0, 1.0]);
        other.model_version = "hash:other".to_string();
        let err = VectorIndex::build(
            IndexTag {
                params: params(2),
                built_at: Utc::now(),
            },
            vec![doc("a.md")],
            vec![embedded("a.md", 0, vec![1.0, 0.0]), other],
        )
        .unwrap_err();
        assert!(matches!(err, Error::MixedModelVersions { .. }));
    }

    #[test]
    fn test_zero_vector_rejected_at_build() {
        let err = VectorIndex::build(
            IndexTag {
                params: params(2),
                built_at: Utc::now(),
            },
            vec![doc("a.md")],
            vec![embedded("a.md", 0, vec![0.0, 0.0])],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEmbedding(_)));
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let index = sample_index();
        assert!(matches!(
            index.query(&[1.0, 0.0, 0.0], 2).unwrap_err(),
            Error::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn test_inner_product_metric() {
        let mut p = params(2);
        p.metric = Metric::InnerProduct;
        let index = VectorIndex::build(
            IndexTag {
                params: p,
                built_at: Utc::now(),
            },
            vec![doc("a.md")],
            vec![
                embedded("a.md", 0, vec![1.0, 0.0]),
                embedded("a.md", 1, vec![3.0, 0.0]),
            ],
        )
        .unwrap();
        let results = index.query(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].chunk.ordinal, 1);
        assert_eq!(results[0].score, 3.0);
    }

    #[test]
    fn test_params_mismatch_names_field() {
        let stored = params(2);
        let mut expected = params(2);
        expected.model_version = "openai:text-embedding-3-small".to_string();
        match stored.ensure_matches(&expected).unwrap_err() {
            Error::IndexMismatch { field, .. } => assert_eq!(field, "embedding model version"),
            other => panic!("unexpected error: {}", other),
        }
        expected = params(2);
        expected.chunking.overlap_tokens = 20;
        assert!(stored.ensure_matches(&expected).is_err());
        assert!(stored.ensure_matches(&params(2)).is_ok());
    }
}
