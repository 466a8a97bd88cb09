//! Query rendering and grounding-context assembly.
//!
//! A [`Retriever`] owns a shared, already-built [`VectorIndex`] and the
//! [`Embedder`] that produced it. It never loads or rebuilds the index
//! itself; callers inject one, which keeps rebuild-and-swap and tests with
//! a hand-made index straightforward.
//!
//! Each retrieved passage is rendered as a numbered block:
//!
//! ```text
//! [1] WHO Infant Feeding — Bottle volumes (WHO, score 0.812)
//! At one week, 60 to 90 ml per feed...
//! ```
//!
//! The numbers are the citation markers the analyzer asks the model to use.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, Embedder};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{describe_age, AnalysisRequest, Citation, Query, ScoredChunk};

/// Intent used when querying on behalf of an analysis request.
pub const ANALYSIS_INTENT: &str = "recommendations bottle volume feeding frequency";

/// Formatted context plus the passages it was built from.
#[derive(Debug, Clone, Default)]
pub struct Grounding {
    pub context: String,
    /// Passages in marker order: `passages[0]` is `[1]`.
    pub passages: Vec<ScoredChunk>,
    /// Distinct (document, section) sources in rank order.
    pub citations: Vec<Citation>,
}

impl Grounding {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Source behind citation marker `[marker]` (1-based).
    pub fn citation(&self, marker: usize) -> Option<Citation> {
        marker
            .checked_sub(1)
            .and_then(|i| self.passages.get(i))
            .map(citation_of)
    }
}

fn citation_of(p: &ScoredChunk) -> Citation {
    Citation {
        document_id: p.chunk.document_id.clone(),
        document_title: p.document_title.clone(),
        section: p.chunk.section.clone(),
    }
}

/// Build the retrieval query for an analysis request: the subject's age and
/// its dominant feeding type.
pub fn query_for_request(request: &AnalysisRequest) -> Query {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in &request.events {
        *counts.entry(event.kind.as_str()).or_default() += 1;
    }
    // BTreeMap iteration makes ties resolve to the alphabetically first type.
    let dominant = counts
        .iter()
        .fold(None, |best: Option<(&str, usize)>, (&kind, &n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((kind, n)),
        })
        .map(|(kind, _)| kind.to_string());

    Query {
        age_days: Some(request.subject.age_days),
        event_types: dominant.into_iter().collect(),
        intent: ANALYSIS_INTENT.to_string(),
    }
}

/// Render a query into the text that gets embedded.
pub fn render_query(query: &Query) -> String {
    let mut parts = Vec::new();
    let intent = query.intent.trim();
    if !intent.is_empty() {
        parts.push(intent.to_string());
    }
    if let Some(days) = query.age_days {
        parts.push(format!("infant {} months ({})", days / 30, describe_age(days)));
    }
    for kind in &query.event_types {
        parts.push(match kind.as_str() {
            "bottle" => "bottle formula".to_string(),
            other => other.replace('_', " "),
        });
    }
    parts.join(" ")
}

pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    max_context_chars: usize,
}

impl Retriever {
    /// Pair an index with the embedder used to query it.
    ///
    /// Fails if the embedder is not the one the index was built with.
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: &RetrievalConfig,
    ) -> Result<Self> {
        let params = &index.tag().params;
        if embedder.model_version() != params.model_version {
            return Err(Error::IndexMismatch {
                field: "embedding model version",
                stored: params.model_version.clone(),
                expected: embedder.model_version().to_string(),
            });
        }
        if embedder.dims() != params.dims {
            return Err(Error::IndexMismatch {
                field: "dimensions",
                stored: params.dims.to_string(),
                expected: embedder.dims().to_string(),
            });
        }
        Ok(Self {
            index,
            embedder,
            top_k: config.top_k,
            max_context_chars: config.max_context_chars,
        })
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub async fn retrieve(&self, query: &Query) -> Result<Grounding> {
        let text = render_query(query);
        let vector = embed_query(self.embedder.as_ref(), &text).await?;
        let passages = self.index.query(&vector, self.top_k)?;
        debug!(query = %text, hits = passages.len(), "retrieved passages");
        Ok(format_grounding(passages, self.max_context_chars))
    }
}

fn render_passage(marker: usize, p: &ScoredChunk) -> String {
    let label = match &p.chunk.section {
        Some(section) => format!("{} — {}", p.document_title, section),
        None => p.document_title.clone(),
    };
    format!(
        "[{}] {} ({}, score {:.3})\n{}",
        marker,
        label,
        p.document_source,
        p.score,
        p.chunk.text.trim()
    )
}

/// Render ranked passages into a context of at most `max_chars` characters.
///
/// Passages are whole or absent: once the next passage would not fit, it
/// and every lower-ranked passage are dropped.
pub fn format_grounding(ranked: Vec<ScoredChunk>, max_chars: usize) -> Grounding {
    let total = ranked.len();
    let mut context = String::new();
    let mut used = 0usize;
    let mut kept = Vec::new();

    for passage in ranked {
        let block = render_passage(kept.len() + 1, &passage);
        let sep = if kept.is_empty() { 0 } else { 2 };
        let cost = block.chars().count() + sep;
        if used + cost > max_chars {
            break;
        }
        if sep > 0 {
            context.push_str("\n\n");
        }
        context.push_str(&block);
        used += cost;
        kept.push(passage);
    }

    if kept.len() < total {
        warn!(
            kept = kept.len(),
            dropped = total - kept.len(),
            max_chars,
            "grounding context truncated"
        );
    }

    let mut seen = HashSet::new();
    let citations = kept
        .iter()
        .map(citation_of)
        .filter(|c| seen.insert((c.document_id.clone(), c.section.clone())))
        .collect();

    Grounding {
        context,
        passages: kept,
        citations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::tests::sample_index;
    use crate::models::{Event, Period, SubjectProfile};
    use async_trait::async_trait;

    /// Embeds every text to the same fixed vector.
    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_version(&self) -> &str {
            "hash:test"
        }
        fn dims(&self) -> usize {
            self.0.len()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    fn retriever(top_k: usize, max_context_chars: usize) -> Retriever {
        Retriever::new(
            Arc::new(sample_index()),
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            &RetrievalConfig {
                top_k,
                max_context_chars,
            },
        )
        .unwrap()
    }

    fn event(hour: u32, kind: &str) -> Event {
        Event {
            timestamp: chrono::NaiveDate::from_ymd_opt(2026, 2, 23)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            kind: kind.to_string(),
            quantity: 70,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_retrieve_orders_and_bounds_results() {
        let r = retriever(3, 10_000);
        let g = r.retrieve(&Query::default()).await.unwrap();
        assert_eq!(g.passages.len(), 3);
        for pair in g.passages.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(g.passages[0].chunk.document_id, "a.md");
        assert!(g.context.starts_with("[1] Title of a.md — Volumes (WHO, score 1.000)"));
        assert!(g.context.contains("[3] "));
    }

    #[tokio::test]
    async fn test_top_k_larger_than_index() {
        let g = retriever(50, 10_000).retrieve(&Query::default()).await.unwrap();
        assert_eq!(g.passages.len(), 4);
    }

    #[tokio::test]
    async fn test_truncation_drops_lowest_ranked_whole_passages() {
        let full = retriever(4, 10_000).retrieve(&Query::default()).await.unwrap();
        let first_two: usize = full.context.split("\n\n").take(2).map(|b| b.chars().count()).sum::<usize>() + 2;

        let g = retriever(4, first_two + 5).retrieve(&Query::default()).await.unwrap();
        assert_eq!(g.passages.len(), 2);
        assert!(g.context.chars().count() <= first_two + 5);
        assert!(g.context.ends_with("text"));
        assert_eq!(g.passages[0].chunk, full.passages[0].chunk);
        assert_eq!(g.passages[1].chunk, full.passages[1].chunk);
    }

    #[tokio::test]
    async fn test_context_too_small_for_any_passage() {
        let g = retriever(4, 10).retrieve(&Query::default()).await.unwrap();
        assert!(g.is_empty());
        assert!(g.context.is_empty());
        assert!(g.citations.is_empty());
    }

    #[test]
    fn test_citations_are_deduplicated_and_markers_resolve() {
        let index = sample_index();
        let ranked = index.query(&[1.0, 0.0], 4).unwrap();
        let g = format_grounding(ranked, 10_000);
        // Every sample chunk shares the "Volumes" section: one per document.
        assert_eq!(g.citations.len(), 2);
        assert_eq!(g.citation(1).unwrap().document_id, "a.md");
        assert!(g.citation(0).is_none());
        assert!(g.citation(5).is_none());
    }

    #[test]
    fn test_retriever_rejects_foreign_embedder() {
        let err = Retriever::new(
            Arc::new(sample_index()),
            Arc::new(HashEmbedder::new("hash:other", 2)),
            &RetrievalConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::IndexMismatch { .. }));
    }

    #[test]
    fn test_query_for_request_uses_dominant_feeding_type() {
        let request = AnalysisRequest {
            subject: SubjectProfile {
                id: "b1".into(),
                age_days: 65,
                name: None,
                birth_weight_grams: None,
            },
            events: vec![event(1, "breastfeeding"), event(2, "bottle"), event(3, "bottle")],
            period: Period::Day,
        };
        let q = query_for_request(&request);
        assert_eq!(q.event_types, vec!["bottle".to_string()]);
        assert_eq!(
            render_query(&q),
            "recommendations bottle volume feeding frequency infant 2 months (2 months) bottle formula"
        );
    }

    #[test]
    fn test_render_query_without_age_or_types() {
        let q = Query {
            intent: "  sleep safety ".into(),
            ..Query::default()
        };
        assert_eq!(render_query(&q), "sleep safety");
    }
}
