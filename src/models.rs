//! Core data models used throughout the pipeline.
//!
//! Reference-side types ([`Document`], [`Chunk`], [`ScoredChunk`]) flow
//! through indexing and retrieval. Request-side types ([`AnalysisRequest`],
//! [`AnalysisResult`]) are the boundary with the record-keeping subsystem
//! and the presentation layer.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Placeholder content for a section the model left empty.
pub const NONE_NOTED: &str = "None noted.";

/// A versioned reference document. Replaced wholesale on corpus update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Stable identifier: the path relative to the corpus root.
    pub id: String,
    pub title: String,
    /// Issuing authority (e.g. `"WHO"`).
    pub source: String,
    pub body: String,
    pub revision: String,
}

/// A bounded span of one document's body.
///
/// `start..end` are byte offsets into the parent body and `text` is exactly
/// that slice, so consecutive chunks can be de-overlapped back into the
/// original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub document_id: String,
    pub ordinal: u32,
    pub start: usize,
    pub end: usize,
    /// Heading in force at the chunk's start, if any.
    pub section: Option<String>,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// A chunk returned by a similarity query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub document_title: String,
    pub document_source: String,
    pub score: f32,
}

/// A subject-context descriptor used to form retrieval text. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub age_days: Option<u32>,
    pub event_types: Vec<String>,
    pub intent: String,
}

/// A reference passage the analysis may cite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub document_title: String,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub id: String,
    pub age_days: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub birth_weight_grams: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: NaiveDateTime,
    /// Feeding type, e.g. `"bottle"` or `"breastfeeding"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Quantity in millilitres.
    pub quantity: u32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
}

impl Period {
    pub fn label(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
        }
    }
}

/// Human-readable age: days under two weeks, weeks under eight weeks,
/// months after that.
pub fn describe_age(days: u32) -> String {
    fn plural(n: u32, unit: &str) -> String {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    }
    if days < 14 {
        plural(days, "day")
    } else if days < 56 {
        plural(days / 7, "week")
    } else {
        plural(days / 30, "month")
    }
}

/// Input from the record-keeping subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub subject: SubjectProfile,
    pub events: Vec<Event>,
    pub period: Period,
}

/// The fixed, ordered set of sections every analysis contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionName {
    PositiveObservations,
    Concerns,
    Recommendations,
    Summary,
}

impl SectionName {
    pub const ALL: [SectionName; 4] = [
        SectionName::PositiveObservations,
        SectionName::Concerns,
        SectionName::Recommendations,
        SectionName::Summary,
    ];

    /// Heading text the model is instructed to emit.
    pub fn heading(&self) -> &'static str {
        match self {
            SectionName::PositiveObservations => "Positive observations",
            SectionName::Concerns => "Concerns",
            SectionName::Recommendations => "Recommendations",
            SectionName::Summary => "Summary",
        }
    }
}

/// Section texts in their fixed presentation order. Every field is always
/// populated; empty content is [`NONE_NOTED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    pub positive_observations: String,
    pub concerns: String,
    pub recommendations: String,
    pub summary: String,
}

impl Sections {
    pub fn get(&self, name: SectionName) -> &str {
        match name {
            SectionName::PositiveObservations => &self.positive_observations,
            SectionName::Concerns => &self.concerns,
            SectionName::Recommendations => &self.recommendations,
            SectionName::Summary => &self.summary,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SectionName, &str)> {
        SectionName::ALL.into_iter().map(move |name| (name, self.get(name)))
    }
}

/// Output to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sections: Sections,
    pub citations: Vec<Citation>,
    /// Whether retrieval context was supplied to the model.
    pub grounded: bool,
}

impl AnalysisResult {
    /// True when the section has no substantive content.
    pub fn is_none_noted(&self, name: SectionName) -> bool {
        is_none_marker(self.sections.get(name))
    }

    /// Render as markdown with one heading per section, then sources.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for (name, text) in self.sections.iter() {
            out.push_str(&format!("### {}\n{}\n\n", name.heading(), text));
        }
        if !self.citations.is_empty() {
            out.push_str("### Sources\n");
            for (i, c) in self.citations.iter().enumerate() {
                match &c.section {
                    Some(section) => {
                        out.push_str(&format!("[{}] {} — {}\n", i + 1, c.document_title, section))
                    }
                    None => out.push_str(&format!("[{}] {}\n", i + 1, c.document_title)),
                }
            }
        }
        out.trim_end().to_string()
    }
}

/// Recognizes the explicit empty markers a model may write for a section.
pub fn is_none_marker(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_start_matches(['-', '*', ' '])
        .trim_end_matches(['.', '!'])
        .to_ascii_lowercase();
    normalized.is_empty()
        || matches!(
            normalized.as_str(),
            "none" | "none noted" | "n/a" | "nothing to report" | "no concerns" | "nothing noted"
        )
}
