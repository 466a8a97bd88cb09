//! Structured, optionally grounded analysis of a feeding window.
//!
//! [`Analyzer::analyze`] is the single entry point for both conditions the
//! evaluation harness compares: passing `None` (or an empty [`Grounding`])
//! produces the ungrounded prompt, which differs from the grounded one only
//! by the absence of the reference block and its citation instructions.
//!
//! # Output contract
//!
//! The model is asked for four `###` headings in a fixed order. The reply
//! is parsed by [`parse_sections`]; if any heading is missing the model is
//! re-prompted once with the names of the missing sections, and a second
//! incomplete reply is a [`Error::StructuredOutput`]. A partially-labeled
//! result is never returned.

use chrono::{NaiveDate, Timelike};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AnalysisConfig, LlmConfig};
use crate::error::{Error, Result};
use crate::llm::{generate, CallPolicy, CompletionRequest, LanguageModel};
use crate::models::{
    describe_age, is_none_marker, AnalysisRequest, AnalysisResult, Citation, Event, SectionName,
    Sections, NONE_NOTED,
};
use crate::retriever::Grounding;

pub struct Analyzer {
    model: Arc<dyn LanguageModel>,
    policy: CallPolicy,
    max_tokens: u32,
    temperature: f32,
    max_listed_events: usize,
    language: String,
}

impl Analyzer {
    pub fn new(model: Arc<dyn LanguageModel>, llm: &LlmConfig, analysis: &AnalysisConfig) -> Self {
        Self {
            model,
            policy: CallPolicy::from(llm),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            max_listed_events: analysis.max_listed_events,
            language: analysis.language.clone(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Analyze `request`, grounded on `grounding` when it has passages.
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        grounding: Option<&Grounding>,
    ) -> Result<AnalysisResult> {
        let grounding = grounding.filter(|g| !g.is_empty());
        let prompt = build_prompt(request, grounding, self.max_listed_events, &self.language);

        let raw = self.complete(prompt.clone()).await?;
        let sections = match parse_sections(&raw) {
            Ok(sections) => sections,
            Err(missing) => {
                warn!(
                    subject = %request.subject.id,
                    missing = ?missing.iter().map(|s| s.heading()).collect::<Vec<_>>(),
                    "analysis reply incomplete, re-prompting once"
                );
                let retry = self.complete(correction_prompt(&prompt, &raw, &missing)).await?;
                parse_sections(&retry).map_err(|still_missing| Error::StructuredOutput {
                    missing: still_missing.iter().map(|s| s.heading().to_string()).collect(),
                })?
            }
        };

        let citations = match grounding {
            Some(g) => {
                let cited = resolve_citations(&sections, g);
                if cited.is_empty() {
                    warn!(
                        subject = %request.subject.id,
                        "grounded analysis cites no reference passage"
                    );
                }
                cited
            }
            None => Vec::new(),
        };

        info!(
            subject = %request.subject.id,
            grounded = grounding.is_some(),
            citations = citations.len(),
            "analysis complete"
        );
        Ok(AnalysisResult {
            sections,
            citations,
            grounded: grounding.is_some(),
        })
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let request = CompletionRequest {
            prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        generate(self.model.as_ref(), &request, self.policy).await
    }
}

// ============ Prompt ============

/// Assemble the analysis prompt.
pub fn build_prompt(
    request: &AnalysisRequest,
    grounding: Option<&Grounding>,
    max_listed_events: usize,
    language: &str,
) -> String {
    let subject = &request.subject;
    let mut out = String::new();

    out.push_str(
        "You are a pediatric assistant specialised in infant nutrition.\n\
         Analyse the feeding data below and give caring, precise, actionable recommendations.\n",
    );
    if let Some(g) = grounding {
        out.push_str(
            "Base your analysis on the reference excerpts below. Cite every excerpt you rely on \
             with its bracketed marker, for example [1].\n\
             If excerpts from different sources give different figures, state each range with \
             its source instead of choosing one.\n\n",
        );
        out.push_str("## Reference context\n");
        out.push_str(&g.context);
        out.push('\n');
    }

    out.push_str("\n## Subject profile\n");
    out.push_str(&format!("- Identifier: {}\n", subject.id));
    if let Some(name) = &subject.name {
        out.push_str(&format!("- Name: {}\n", name));
    }
    out.push_str(&format!("- Age: {}\n", describe_age(subject.age_days)));
    if let Some(grams) = subject.birth_weight_grams {
        out.push_str(&format!("- Birth weight: {} g\n", grams));
    }

    out.push_str(&format!(
        "\n## Feeding data ({})\n",
        period_label(request)
    ));
    out.push_str(&summarize_events(&request.events, max_listed_events));
    out.push('\n');

    out.push_str(&format!(
        "\n## Requested analysis\nAnswer in {}, using exactly these four headings in this order:\n\n",
        language
    ));
    for name in SectionName::ALL {
        out.push_str(&format!("### {}\n{}\n\n", name.heading(), section_guidance(name)));
    }
    out.push_str(
        "Be reassuring when the data is normal. Recommend consulting a pediatrician only if a \
         significant anomaly is detected.\n",
    );
    out
}

fn section_guidance(name: SectionName) -> &'static str {
    match name {
        SectionName::PositiveObservations => {
            "What is going well (volumes, frequency, regularity)."
        }
        SectionName::Concerns => {
            "Deviations from the recommendations for this age (volumes too low or too high, \
             intervals too long or too short). Write \"None noted.\" if there are none."
        }
        SectionName::Recommendations => "Two or three concrete actions suited to the age.",
        SectionName::Summary => "One sentence summarising feeding over the period.",
    }
}

fn period_label(request: &AnalysisRequest) -> String {
    let first = request.events.iter().map(|e| e.timestamp.date()).min();
    let last = request.events.iter().map(|e| e.timestamp.date()).max();
    match (first, last) {
        (Some(a), Some(b)) if a == b => format!("{} of {}", request.period.label(), a),
        (Some(a), Some(b)) => format!("{} of {} to {}", request.period.label(), a, b),
        _ => request.period.label().to_string(),
    }
}

fn feeding_type_label(kinds: &BTreeSet<&str>) -> String {
    let v: Vec<&str> = kinds.iter().copied().collect();
    match v.as_slice() {
        ["bottle"] => "bottle only".to_string(),
        ["breastfeeding"] => "breastfeeding only".to_string(),
        ["bottle", "breastfeeding"] => "mixed (bottle + breastfeeding)".to_string(),
        _ => v.join(", "),
    }
}

fn format_minutes(minutes: i64) -> String {
    format!("{}h{:02}", minutes / 60, minutes % 60)
}

/// Summarize an event window for the prompt.
///
/// Up to `max_listed` events are listed chronologically; beyond that the
/// list is replaced by per-day aggregates.
pub fn summarize_events(events: &[Event], max_listed: usize) -> String {
    if events.is_empty() {
        return "No events recorded for this period.".to_string();
    }

    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    let count = sorted.len();
    let total: u64 = sorted.iter().map(|e| e.quantity as u64).sum();
    let min = sorted.iter().map(|e| e.quantity).min().unwrap_or(0);
    let max = sorted.iter().map(|e| e.quantity).max().unwrap_or(0);
    let kinds: BTreeSet<&str> = sorted.iter().map(|e| e.kind.as_str()).collect();

    let mut out = format!(
        "Feeds: {}\nTotal volume: {} ml\nMean per feed: {} ml (min {}, max {})\nFeeding type: {}\n",
        count,
        total,
        (total as f64 / count as f64).round() as u64,
        min,
        max,
        feeding_type_label(&kinds)
    );

    let gaps: Vec<i64> = sorted
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_minutes())
        .collect();
    if !gaps.is_empty() {
        let mean = gaps.iter().sum::<i64>() / gaps.len() as i64;
        let longest = gaps.iter().copied().max().unwrap_or(0);
        out.push_str(&format!(
            "Mean interval: {}\nLongest interval: {}\n",
            format_minutes(mean),
            format_minutes(longest)
        ));
    }

    let multi_day = sorted.first().map(|e| e.timestamp.date()) != sorted.last().map(|e| e.timestamp.date());

    if count <= max_listed {
        out.push_str("Chronological detail:\n");
        for e in &sorted {
            let when = if multi_day {
                e.timestamp.format("%Y-%m-%d %H:%M").to_string()
            } else {
                format!("{:02}:{:02}", e.timestamp.hour(), e.timestamp.minute())
            };
            out.push_str(&format!("- {} : {} ml ({})", when, e.quantity, e.kind));
            if let Some(note) = e.note.as_deref().filter(|n| !n.trim().is_empty()) {
                out.push_str(&format!(" — note: {}", note.trim()));
            }
            out.push('\n');
        }
    } else {
        let mut days: BTreeMap<NaiveDate, Vec<u32>> = BTreeMap::new();
        for e in &sorted {
            days.entry(e.timestamp.date()).or_default().push(e.quantity);
        }
        out.push_str("Per-day totals:\n");
        for (day, q) in days {
            out.push_str(&format!(
                "- {}: {} feeds, {} ml (min {}, max {})\n",
                day,
                q.len(),
                q.iter().map(|&x| x as u64).sum::<u64>(),
                q.iter().min().copied().unwrap_or(0),
                q.iter().max().copied().unwrap_or(0)
            ));
        }
    }

    out.trim_end().to_string()
}

fn correction_prompt(original: &str, reply: &str, missing: &[SectionName]) -> String {
    let names: Vec<String> = missing.iter().map(|s| format!("\"### {}\"", s.heading())).collect();
    format!(
        "{}\n\n## Your previous answer\n{}\n\n## Correction\nYour previous answer was missing the \
         required section(s) {}. Reply again with the complete analysis, using all four headings \
         in order. Write \"None noted.\" under a heading that has nothing to report.\n",
        original,
        reply.trim(),
        names.join(", ")
    )
}

// ============ Parsing ============

/// Map a heading line to a section, tolerating emoji, numbering, bold
/// markers, trailing colons, and a few synonyms.
fn match_heading(line: &str) -> Option<SectionName> {
    let text = line.trim_start();
    if !text.starts_with('#') {
        return None;
    }
    let normalized: String = text
        .trim_start_matches('#')
        .trim()
        .trim_start_matches(|c: char| !c.is_alphabetic())
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();

    match normalized.as_str() {
        "positive observations" | "positive points" | "positives" | "strengths" => {
            Some(SectionName::PositiveObservations)
        }
        "concerns" | "points of attention" | "points to watch" => Some(SectionName::Concerns),
        "recommendations" => Some(SectionName::Recommendations),
        "summary" | "synthesis" | "overall summary" => Some(SectionName::Summary),
        _ => None,
    }
}

/// Split a model reply into the four sections.
///
/// Returns the missing section names when any heading is absent. Text
/// under an unrecognized heading stays with the preceding section; text
/// before the first recognized heading is discarded.
pub fn parse_sections(raw: &str) -> std::result::Result<Sections, Vec<SectionName>> {
    let mut found: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
    let mut current: Option<usize> = None;

    for line in raw.lines() {
        if let Some(name) = match_heading(line) {
            let i = SectionName::ALL.iter().position(|n| *n == name).unwrap_or(0);
            found.entry(i).or_default();
            current = Some(i);
            continue;
        }
        if let Some(i) = current {
            found.entry(i).or_default().push(line);
        }
    }

    let missing: Vec<SectionName> = SectionName::ALL
        .iter()
        .enumerate()
        .filter(|(i, _)| !found.contains_key(i))
        .map(|(_, n)| *n)
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }

    let text = |i: usize| -> String {
        let body = found.get(&i).map(|l| l.join("\n")).unwrap_or_default();
        let body = body.trim();
        if is_none_marker(body) {
            NONE_NOTED.to_string()
        } else {
            body.to_string()
        }
    };
    Ok(Sections {
        positive_observations: text(0),
        concerns: text(1),
        recommendations: text(2),
        summary: text(3),
    })
}

/// Bracketed numeric markers in `text`, in order of appearance. `[2, 3]`
/// yields both numbers.
pub fn citation_markers(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close) => {
                let inner = &after[..close];
                let numbers: Option<Vec<usize>> =
                    inner.split(',').map(|p| p.trim().parse().ok()).collect();
                if let Some(numbers) = numbers {
                    out.extend(numbers);
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    out
}

fn resolve_citations(sections: &Sections, grounding: &Grounding) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut cited = Vec::new();
    for (_, text) in sections.iter() {
        for marker in citation_markers(text) {
            match grounding.citation(marker) {
                Some(c) => {
                    if seen.insert((c.document_id.clone(), c.section.clone())) {
                        cited.push(c);
                    }
                }
                None => debug!(marker, "ignoring citation marker with no passage"),
            }
        }
    }
    cited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::sample_index;
    use crate::models::{Period, SubjectProfile};
    use crate::retriever::format_grounding;
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies and records every prompt it receives.
    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::permanent("script exhausted"))
        }
    }

    const COMPLETE: &str = "### ✅ Positive observations\nRegular feeds of 70-80 ml [1].\n\n\
                            ### Concerns\nNone noted.\n\n\
                            ### Recommendations\nKeep feeding on demand [2].\n\n\
                            ### Summary\nFeeding matches the 60-90 ml range [1].";

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn request(volumes: &[u32]) -> AnalysisRequest {
        AnalysisRequest {
            subject: SubjectProfile {
                id: "b1".into(),
                age_days: 7,
                name: Some("Lea".into()),
                birth_weight_grams: Some(3200),
            },
            events: volumes
                .iter()
                .enumerate()
                .map(|(i, &q)| Event {
                    timestamp: at(23, (i as u32) * 3, 0),
                    kind: "bottle".into(),
                    quantity: q,
                    note: None,
                })
                .collect(),
            period: Period::Day,
        }
    }

    fn analyzer(model: Arc<Scripted>) -> Analyzer {
        Analyzer::new(model, &LlmConfig::default(), &AnalysisConfig::default())
    }

    fn grounding() -> Grounding {
        format_grounding(sample_index().query(&[1.0, 0.0], 4).unwrap(), 10_000)
    }

    #[tokio::test]
    async fn test_grounded_analysis_resolves_citations() {
        let model = Scripted::new(&[COMPLETE]);
        let result = analyzer(model.clone())
            .analyze(&request(&[70, 75, 80, 70, 75, 80]), Some(&grounding()))
            .await
            .unwrap();

        assert!(result.grounded);
        assert!(result.is_none_noted(SectionName::Concerns));
        let ids: Vec<_> = result.citations.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "b.md"]);

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("## Reference context\n[1] Title of a.md"));
        assert!(prompts[0].contains("state each range with its source"));
    }

    #[tokio::test]
    async fn test_grounded_and_ungrounded_prompts_differ_only_by_context() {
        let model = Scripted::new(&[COMPLETE, COMPLETE]);
        let a = analyzer(model.clone());
        let req = request(&[70, 75]);
        a.analyze(&req, Some(&grounding())).await.unwrap();
        let ungrounded = a.analyze(&req, None).await.unwrap();
        assert!(!ungrounded.grounded);
        assert!(ungrounded.citations.is_empty());

        let prompts = model.prompts();
        assert!(!prompts[1].contains("Reference context"));
        let tail = |p: &str| p[p.find("## Subject profile").unwrap()..].to_string();
        assert_eq!(tail(&prompts[0]), tail(&prompts[1]));
    }

    #[tokio::test]
    async fn test_empty_grounding_is_ungrounded() {
        let model = Scripted::new(&[COMPLETE]);
        let result = analyzer(model)
            .analyze(&request(&[70]), Some(&Grounding::default()))
            .await
            .unwrap();
        assert!(!result.grounded);
    }

    #[tokio::test]
    async fn test_missing_section_reprompts_once() {
        let partial = "### Positive observations\nGood.\n### Summary\nFine.";
        let model = Scripted::new(&[partial, COMPLETE]);
        let result = analyzer(model.clone())
            .analyze(&request(&[70]), None)
            .await
            .unwrap();
        assert_eq!(result.sections.summary, "Feeding matches the 60-90 ml range [1].");

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("\"### Concerns\", \"### Recommendations\""));
    }

    #[tokio::test]
    async fn test_missing_section_twice_is_structured_error() {
        let partial = "### Positive observations\nGood.\n### Concerns\nNone.\n### Summary\nFine.";
        let model = Scripted::new(&[partial, partial]);
        let err = analyzer(model.clone())
            .analyze(&request(&[70]), None)
            .await
            .unwrap_err();
        match err {
            Error::StructuredOutput { missing } => {
                assert_eq!(missing, vec!["Recommendations".to_string()])
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(model.prompts().len(), 2);
    }

    #[test]
    fn test_parse_sections_tolerates_decoration() {
        let raw = "Here is the analysis.\n## 1. Positive observations:\n- steady\n\
                   ### ⚠️ **Concerns**\n\n### Recommendations\nOffer 80 ml.\n#### Detail\nmore\n### 📊 Synthesis\nOk.";
        let s = parse_sections(raw).unwrap();
        assert_eq!(s.positive_observations, "- steady");
        assert_eq!(s.concerns, NONE_NOTED);
        assert_eq!(s.recommendations, "Offer 80 ml.\n#### Detail\nmore");
        assert_eq!(s.summary, "Ok.");
    }

    #[test]
    fn test_citation_markers() {
        assert_eq!(citation_markers("a [1] b [2, 3] c [x] [4]"), vec![1, 2, 3, 4]);
        assert!(citation_markers("no markers [").is_empty());
    }

    #[test]
    fn test_summarize_events_lists_chronologically() {
        let mut req = request(&[80, 70]);
        req.events.reverse();
        req.events[0].note = Some("spat up".into());
        let s = summarize_events(&req.events, 24);
        assert!(s.contains("Feeds: 2\nTotal volume: 150 ml"));
        assert!(s.contains("Feeding type: bottle only"));
        assert!(s.contains("Mean interval: 3h00"));
        let first = s.find("- 00:00 : 80 ml (bottle)").unwrap();
        let second = s.find("- 03:00 : 70 ml (bottle) — note: spat up").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_summarize_events_aggregates_beyond_limit() {
        let mut req = request(&[60, 70, 80]);
        req.events[2].timestamp = at(24, 1, 0);
        req.events[1].kind = "breastfeeding".into();
        let s = summarize_events(&req.events, 2);
        assert!(s.contains("Feeding type: mixed (bottle + breastfeeding)"));
        assert!(s.contains("Per-day totals:\n- 2026-02-23: 2 feeds, 130 ml (min 60, max 70)\n- 2026-02-24: 1 feeds, 80 ml"));
        assert!(!s.contains("Chronological detail"));
    }

    #[test]
    fn test_summarize_no_events() {
        assert_eq!(summarize_events(&[], 24), "No events recorded for this period.");
    }

    #[test]
    fn test_prompt_includes_profile() {
        let p = build_prompt(&request(&[70]), None, 24, "English");
        assert!(p.contains("- Name: Lea\n- Age: 7 days\n- Birth weight: 3200 g"));
        assert!(p.contains("## Feeding data (day of 2026-02-23)"));
        assert!(p.contains("Answer in English"));
    }
}
