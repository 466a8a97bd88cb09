//! Error taxonomy for the indexing, retrieval, analysis, and evaluation
//! pipeline.
//!
//! Errors fall into five classes:
//!
//! | Class | Variants | Recovery |
//! |-------|----------|----------|
//! | Ingestion | [`Error::Ingestion`], [`Error::EmptyCorpus`] | fix the corpus, rebuild |
//! | Model call | [`Error::Model`], [`Error::InvalidEmbedding`] | one retry if transient |
//! | Index | [`Error::IndexMismatch`], [`Error::MixedModelVersions`], [`Error::IndexNotFound`], [`Error::DimensionMismatch`] | explicit rebuild |
//! | Structured output | [`Error::StructuredOutput`], [`Error::JudgeOutput`] | one corrective re-prompt |
//! | Evaluation | recorded in the run artifact, never propagated | none |

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a failed model call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// Timeouts, rate limits, server errors, connection failures.
    Transient,
    /// Invalid requests, authentication failures, malformed responses.
    Permanent,
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelErrorKind::Transient => f.write_str("transient"),
            ModelErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to ingest {path}: {reason}")]
    Ingestion { path: PathBuf, reason: String },

    #[error("no reference documents found in {0}")]
    EmptyCorpus(PathBuf),

    #[error("{kind} model error: {message}")]
    Model {
        kind: ModelErrorKind,
        message: String,
    },

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("index {field} mismatch: artifact has '{stored}', configuration expects '{expected}'; rebuild the index")]
    IndexMismatch {
        field: &'static str,
        stored: String,
        expected: String,
    },

    #[error("embedding model versions differ within one build: expected '{expected}', found '{found}'")]
    MixedModelVersions { expected: String, found: String },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index not found at {0}; run `btrag index build` first")]
    IndexNotFound(PathBuf),

    #[error("model response is missing required sections: {}", missing.join(", "))]
    StructuredOutput { missing: Vec<String> },

    #[error("judge output could not be parsed: {0}")]
    JudgeOutput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Model {
            kind: ModelErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Model {
            kind: ModelErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True only for model-call failures classified as retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Model {
                kind: ModelErrorKind::Transient,
                ..
            }
        )
    }

    /// Classify a transport-level failure from `reqwest`.
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Error::transient(format!("{}: {}", context, err))
        } else {
            Error::permanent(format!("{}: {}", context, err))
        }
    }

    /// Classify an unsuccessful HTTP status: 408, 429, and 5xx are retryable.
    pub fn from_status(context: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", context, status, body);
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            Error::transient(message)
        } else {
            Error::permanent(message)
        }
    }
}
