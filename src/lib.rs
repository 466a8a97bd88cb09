//! # BabyTrack RAG
//!
//! Retrieval-grounded analysis of infant feeding records.
//!
//! A small, versioned corpus of reference documents (WHO, SFP guidance) is
//! chunked, embedded, and published as an immutable vector index. At
//! request time a feeding window is turned into a query, the closest
//! passages are retrieved, and a language model writes a four-section,
//! cited analysis. An evaluation harness scores that analysis with and
//! without retrieval, using the same model as a judge.
//!
//! ## Architecture
//!
//! ```text
//! build time:   corpus ──▶ chunk ──▶ embedding ──▶ index ──▶ persist (SQLite artifact)
//!
//! request:      AnalysisRequest ──▶ retriever ──▶ Grounding ──▶ analyzer ──▶ AnalysisResult
//!                                      ▲
//!                              Arc<VectorIndex>
//!
//! evaluation:   Scenario ──▶ analyzer (grounded, ungrounded) ──▶ judge ──▶ RunRecord
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! btrag index build                          # chunk, embed, publish
//! btrag retrieve "bottle volume" --age-days 7
//! btrag analyze --request demos/newborn.json
//! btrag eval run                             # grounded vs ungrounded scores
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`corpus`] | Reference document loading |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`retry`] | Bounded retry and timeouts for model calls |
//! | [`index`] | Exact top-k vector index |
//! | [`persist`] | Index artifact storage |
//! | [`indexer`] | Offline build pipeline |
//! | [`retriever`] | Query rendering and grounding context |
//! | [`llm`] | Language model abstraction |
//! | [`analyzer`] | Prompting and section parsing |
//! | [`judge`] | Rubric scoring |
//! | [`eval`] | Paired evaluation harness |
//! | [`commands`] | CLI command handlers |

pub mod analyzer;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod index;
pub mod indexer;
pub mod judge;
pub mod llm;
pub mod models;
pub mod persist;
pub mod retriever;
pub mod retry;
