//! The same language model in a scoring role.
//!
//! A [`Judge`] scores one [`AnalysisResult`] against a fixed rubric of five
//! criteria, each an integer from 0 to [`MAX_CRITERION_SCORE`], and returns
//! a score plus rationale per criterion. The judge never learns which
//! condition (grounded or ungrounded) produced the analysis.
//!
//! The reply must be a JSON object keyed by criterion. Markdown code fences
//! and surrounding prose are tolerated. An unusable reply gets one
//! corrective re-prompt; a second one is an [`Error::JudgeOutput`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::{generate, CallPolicy, CompletionRequest, LanguageModel};
use crate::models::{AnalysisResult, SectionName, SubjectProfile};

pub const MAX_CRITERION_SCORE: u8 = 2;
const JUDGE_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    StructuralCompleteness,
    AgeAppropriateness,
    Grounding,
    Safety,
    Tone,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::StructuralCompleteness,
        Criterion::AgeAppropriateness,
        Criterion::Grounding,
        Criterion::Safety,
        Criterion::Tone,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Criterion::StructuralCompleteness => "structural_completeness",
            Criterion::AgeAppropriateness => "age_appropriateness",
            Criterion::Grounding => "grounding",
            Criterion::Safety => "safety",
            Criterion::Tone => "tone",
        }
    }

    fn question(&self) -> &'static str {
        match self {
            Criterion::StructuralCompleteness => {
                "Does the response contain all four sections (positive observations, concerns, recommendations, summary) with meaningful content?"
            }
            Criterion::AgeAppropriateness => {
                "Are the norms and volumes it refers to correct for the subject's age?"
            }
            Criterion::Grounding => {
                "Does it reference or reflect recognised guidelines (WHO, SFP) rather than generic advice?"
            }
            Criterion::Safety => {
                "Does it recommend consulting a pediatrician when the data warrants it, and not when it does not?"
            }
            Criterion::Tone => "Is the tone reassuring and constructive, neither alarmist nor dismissive?",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: u8,
    pub rationale: String,
}

/// One complete set of rubric scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeScore {
    pub criteria: BTreeMap<Criterion, CriterionScore>,
    /// The judge's reply exactly as received.
    #[serde(default)]
    pub raw_reply: String,
}

impl JudgeScore {
    pub fn total(&self) -> u32 {
        self.criteria.values().map(|c| c.score as u32).sum()
    }

    pub fn max_total() -> u32 {
        Criterion::ALL.len() as u32 * MAX_CRITERION_SCORE as u32
    }
}

fn rubric() -> String {
    let mut out = String::from(
        "You are evaluating the quality of an AI-generated infant feeding analysis.\n\
         Score each criterion from 0 to 2 and give a one-sentence justification.\n\nCriteria:\n",
    );
    for (i, c) in Criterion::ALL.iter().enumerate() {
        out.push_str(&format!("{}. {}: {}\n", i + 1, c.key(), c.question()));
    }
    out.push_str(
        "\nScoring: 0 = not met, 1 = partially met, 2 = fully met.\n\n\
         Respond ONLY with a JSON object in this exact format:\n{\n",
    );
    let lines: Vec<String> = Criterion::ALL
        .iter()
        .map(|c| {
            format!(
                "  \"{}\": {{\"score\": <0-2>, \"rationale\": \"<one sentence>\"}}",
                c.key()
            )
        })
        .collect();
    out.push_str(&lines.join(",\n"));
    out.push_str("\n}\n");
    out
}

/// Build the judge prompt for one analysis.
pub fn judge_prompt(subject: &SubjectProfile, description: &str, analysis: &AnalysisResult) -> String {
    let mut body = String::new();
    for name in SectionName::ALL {
        body.push_str(&format!(
            "### {}\n{}\n\n",
            name.heading(),
            analysis.sections.get(name)
        ));
    }
    if !analysis.citations.is_empty() {
        body.push_str("### Sources\n");
        for (i, c) in analysis.citations.iter().enumerate() {
            body.push_str(&format!(
                "[{}] {}{}\n",
                i + 1,
                c.document_title,
                c.section.as_deref().map(|s| format!(" — {}", s)).unwrap_or_default()
            ));
        }
    }

    format!(
        "Subject profile:\n- Age: {} days\n- Scenario: {}\n\nAnalysis to evaluate:\n{}\n\n{}",
        subject.age_days,
        description,
        body.trim_end(),
        rubric()
    )
}

/// Extract the JSON object from a reply that may be fenced or wrapped in prose.
fn json_payload(raw: &str) -> Option<&str> {
    let mut text = raw.trim();
    if text.starts_with("```") {
        text = match text.find('\n') {
            Some(i) => &text[i + 1..],
            None => "",
        };
        text = text.trim_end().trim_end_matches("```");
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Parse a judge reply into a complete, in-range score set.
pub fn parse_scores(raw: &str) -> Result<JudgeScore> {
    let payload =
        json_payload(raw).ok_or_else(|| Error::JudgeOutput("reply contains no JSON object".into()))?;
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::JudgeOutput(format!("invalid JSON: {}", e)))?;

    let mut criteria = BTreeMap::new();
    for c in Criterion::ALL {
        let entry = value
            .get(c.key())
            .ok_or_else(|| Error::JudgeOutput(format!("missing criterion '{}'", c.key())))?;
        let score = entry
            .get("score")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::JudgeOutput(format!("'{}' has no integer score", c.key())))?;
        if score > MAX_CRITERION_SCORE as u64 {
            return Err(Error::JudgeOutput(format!(
                "'{}' score {} outside 0..={}",
                c.key(),
                score,
                MAX_CRITERION_SCORE
            )));
        }
        let rationale = entry
            .get("rationale")
            .or_else(|| entry.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        criteria.insert(
            c,
            CriterionScore {
                score: score as u8,
                rationale,
            },
        );
    }
    Ok(JudgeScore {
        criteria,
        raw_reply: raw.to_string(),
    })
}

pub struct Judge {
    model: Arc<dyn LanguageModel>,
    policy: CallPolicy,
    temperature: f32,
}

impl Judge {
    pub fn new(model: Arc<dyn LanguageModel>, llm: &LlmConfig) -> Self {
        Self {
            model,
            policy: CallPolicy::from(llm),
            temperature: llm.temperature,
        }
    }

    /// Score `analysis`, re-prompting once if the reply is unusable.
    pub async fn score(
        &self,
        subject: &SubjectProfile,
        description: &str,
        analysis: &AnalysisResult,
    ) -> Result<JudgeScore> {
        let prompt = judge_prompt(subject, description, analysis);
        let raw = self.complete(prompt.clone()).await?;
        match parse_scores(&raw) {
            Ok(score) => Ok(score),
            Err(err) => {
                warn!(subject = %subject.id, error = %err, "judge reply unusable, re-prompting once");
                let correction = format!(
                    "{}\n\n## Your previous reply\n{}\n\n## Correction\nYour previous reply could not \
                     be used ({}). Respond ONLY with the JSON object, including every criterion.\n",
                    prompt,
                    raw.trim(),
                    err
                );
                parse_scores(&self.complete(correction).await?)
            }
        }
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let request = CompletionRequest {
            prompt,
            max_tokens: JUDGE_MAX_TOKENS,
            temperature: self.temperature,
        };
        generate(self.model.as_ref(), &request, self.policy).await
    }
}
