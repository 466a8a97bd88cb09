//! Paired grounded/ungrounded evaluation.
//!
//! Every [`Scenario`] walks the same sequence of states:
//!
//! ```text
//! PENDING ─▶ RUN_GROUNDED ─▶ RUN_UNGROUNDED ─▶ JUDGE_GROUNDED ─▶ JUDGE_UNGROUNDED ─▶ SCORED
//! ```
//!
//! A failure in any state is recorded against its condition and the
//! scenario keeps advancing; a failed scenario never aborts the run. The
//! two conditions of one scenario run sequentially. Separate scenarios run
//! concurrently, up to `[eval] concurrency` at a time.
//!
//! Model output is not assumed repeatable, so a run is only ever
//! summarized from what it recorded: raw scores and rationales are written
//! verbatim to a timestamped [`RunRecord`] that is never rewritten.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::analyzer::Analyzer;
use crate::error::{Error, Result};
use crate::judge::{Criterion, Judge, JudgeScore};
use crate::models::{AnalysisRequest, AnalysisResult, Event, Period, SectionName, SubjectProfile};
use crate::retriever::{query_for_request, Retriever};

// ============ Scenarios ============

/// Qualitative outcome a scenario's analysis is expected to show.
///
/// Checked against the parsed analysis after the fact; never shown to
/// the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    /// Reassuring: positive observations present, no concerns.
    Positive,
    /// At least one concern raised.
    Concern,
    /// The concerns section refers the caregiver to a health professional.
    Professional,
}

const PROFESSIONAL_TERMS: &[&str] = &[
    "pediatrician",
    "paediatrician",
    "doctor",
    "midwife",
    "health professional",
    "healthcare provider",
    "health visitor",
];

impl ExpectedOutcome {
    pub fn is_met(&self, result: &AnalysisResult) -> bool {
        match self {
            ExpectedOutcome::Positive => {
                !result.is_none_noted(SectionName::PositiveObservations)
                    && result.is_none_noted(SectionName::Concerns)
            }
            ExpectedOutcome::Concern => !result.is_none_noted(SectionName::Concerns),
            ExpectedOutcome::Professional => {
                let concerns = result.sections.get(SectionName::Concerns).to_lowercase();
                PROFESSIONAL_TERMS.iter().any(|t| concerns.contains(t))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub expected: Vec<ExpectedOutcome>,
    pub request: AnalysisRequest,
}

#[derive(Deserialize)]
struct ScenarioFile {
    #[serde(rename = "scenario")]
    scenarios: Vec<Scenario>,
}

/// Load scenarios from a TOML file of `[[scenario]]` tables.
pub fn load_scenarios(path: &Path) -> Result<Vec<Scenario>> {
    let raw = std::fs::read_to_string(path)?;
    let file: ScenarioFile = toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid scenario file {}: {}", path.display(), e)))?;
    if file.scenarios.is_empty() {
        return Err(Error::Config(format!(
            "scenario file {} defines no scenarios",
            path.display()
        )));
    }
    Ok(file.scenarios)
}

fn bottle_day(day: NaiveDate, volumes: &[u32], hours: &[u32]) -> Vec<Event> {
    volumes
        .iter()
        .zip(hours)
        .filter_map(|(&quantity, &hour)| {
            day.and_hms_opt(hour, 0, 0).map(|timestamp: NaiveDateTime| Event {
                timestamp,
                kind: "bottle".to_string(),
                quantity,
                note: None,
            })
        })
        .collect()
}

fn builtin(
    id: &str,
    description: &str,
    expected: Vec<ExpectedOutcome>,
    subject: (&str, u32, u32),
    volumes: &[u32],
    hours: &[u32],
) -> Scenario {
    let day = NaiveDate::from_ymd_opt(2026, 2, 23).unwrap_or_default();
    let (name, age_days, birth_weight) = subject;
    Scenario {
        id: id.to_string(),
        description: description.to_string(),
        expected,
        request: AnalysisRequest {
            subject: SubjectProfile {
                id: id.to_string(),
                age_days,
                name: Some(name.to_string()),
                birth_weight_grams: Some(birth_weight),
            },
            events: bottle_day(day, volumes, hours),
            period: Period::Day,
        },
    }
}

/// The three canned scenarios used when no scenario file is configured.
pub fn builtin_scenarios() -> Vec<Scenario> {
    vec![
        builtin(
            "newborn_normal",
            "7-day-old newborn, volumes and frequency within WHO norms",
            vec![ExpectedOutcome::Positive],
            ("Louise", 7, 3200),
            &[70, 75, 70, 80, 75, 70, 75, 80],
            &[0, 2, 4, 7, 10, 13, 16, 19],
        ),
        builtin(
            "newborn_low_volume",
            "10-day-old, volumes too low (possible feeding difficulty)",
            vec![ExpectedOutcome::Concern, ExpectedOutcome::Professional],
            ("Tom", 10, 3500),
            &[40, 35, 40, 45, 35, 40],
            &[0, 3, 6, 10, 14, 18],
        ),
        builtin(
            "infant_2months_normal",
            "2-month-old, regular schedule, volumes appropriate",
            vec![ExpectedOutcome::Positive],
            ("Emma", 60, 3100),
            &[130, 140, 135, 130, 140, 135],
            &[0, 3, 6, 10, 14, 18],
        ),
    ]
}

// ============ Records ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioState {
    Pending,
    RunGrounded,
    RunUngrounded,
    JudgeGrounded,
    JudgeUngrounded,
    Scored,
}

impl ScenarioState {
    pub fn next(self) -> Self {
        match self {
            ScenarioState::Pending => ScenarioState::RunGrounded,
            ScenarioState::RunGrounded => ScenarioState::RunUngrounded,
            ScenarioState::RunUngrounded => ScenarioState::JudgeGrounded,
            ScenarioState::JudgeGrounded => ScenarioState::JudgeUngrounded,
            ScenarioState::JudgeUngrounded | ScenarioState::Scored => ScenarioState::Scored,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationCheck {
    pub outcome: ExpectedOutcome,
    pub met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConditionRecord {
    Scored {
        analysis: AnalysisResult,
        scores: JudgeScore,
        total: u32,
        expectations: Vec<ExpectationCheck>,
    },
    Failed {
        /// State in which the failure happened.
        stage: ScenarioState,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis: Option<AnalysisResult>,
    },
}

impl ConditionRecord {
    pub fn total(&self) -> Option<u32> {
        match self {
            ConditionRecord::Scored { total, .. } => Some(*total),
            ConditionRecord::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: String,
    pub description: String,
    pub state: ScenarioState,
    pub grounded: ConditionRecord,
    pub ungrounded: ConditionRecord,
    /// Grounded minus ungrounded total, when both were scored.
    pub uplift: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub scenarios: usize,
    pub failed_conditions: usize,
    pub max_total: u32,
    pub mean_grounded: Option<f64>,
    pub mean_ungrounded: Option<f64>,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub embedding_model_version: String,
    pub index_built_at: DateTime<Utc>,
    pub criteria: Vec<Criterion>,
    pub scenarios: Vec<ScenarioRecord>,
    pub summary: RunSummary,
}

fn mean(values: &[u32]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
    }
}

/// Aggregate scenario records into the run-level summary.
///
/// Each condition's mean is taken over the scenarios where that condition
/// was scored.
pub fn summarize(records: &[ScenarioRecord]) -> RunSummary {
    let grounded: Vec<u32> = records.iter().filter_map(|r| r.grounded.total()).collect();
    let ungrounded: Vec<u32> = records.iter().filter_map(|r| r.ungrounded.total()).collect();
    let mean_grounded = mean(&grounded);
    let mean_ungrounded = mean(&ungrounded);
    RunSummary {
        scenarios: records.len(),
        failed_conditions: records.len() * 2 - grounded.len() - ungrounded.len(),
        max_total: JudgeScore::max_total(),
        mean_grounded,
        mean_ungrounded,
        delta: mean_grounded.zip(mean_ungrounded).map(|(g, u)| g - u),
    }
}

// ============ Harness ============

pub struct Harness {
    retriever: Arc<Retriever>,
    analyzer: Arc<Analyzer>,
    judge: Arc<Judge>,
    concurrency: usize,
}

/// Output of a RUN_* state: the analysis, or the state and error it failed with.
type RunOutcome = std::result::Result<AnalysisResult, (ScenarioState, Error)>;

impl Harness {
    pub fn new(
        retriever: Arc<Retriever>,
        analyzer: Arc<Analyzer>,
        judge: Arc<Judge>,
        concurrency: usize,
    ) -> Self {
        Self {
            retriever,
            analyzer,
            judge,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every scenario and assemble the run record.
    pub async fn run(&self, scenarios: Vec<Scenario>) -> RunRecord {
        let timestamp = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let ids: Vec<(String, String)> = scenarios
            .iter()
            .map(|s| (s.id.clone(), s.description.clone()))
            .collect();

        for (i, scenario) in scenarios.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let retriever = self.retriever.clone();
            let analyzer = self.analyzer.clone();
            let judge = self.judge.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let record = run_scenario(&retriever, &analyzer, &judge, &scenario).await;
                (i, record)
            });
        }

        let mut slots: Vec<Option<ScenarioRecord>> = vec![None; ids.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, record)) => slots[i] = Some(record),
                Err(e) => warn!(error = %e, "scenario task aborted"),
            }
        }

        let records: Vec<ScenarioRecord> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, (id, description))| {
                slot.unwrap_or_else(|| {
                    let failed = || ConditionRecord::Failed {
                        stage: ScenarioState::Pending,
                        error: "scenario task aborted".to_string(),
                        analysis: None,
                    };
                    ScenarioRecord {
                        id,
                        description,
                        state: ScenarioState::Pending,
                        grounded: failed(),
                        ungrounded: failed(),
                        uplift: None,
                    }
                })
            })
            .collect();

        let index = self.retriever.index().tag();
        RunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            model: self.analyzer.model_name().to_string(),
            embedding_model_version: index.params.model_version.clone(),
            index_built_at: index.built_at,
            criteria: Criterion::ALL.to_vec(),
            summary: summarize(&records),
            scenarios: records,
        }
    }
}

async fn run_grounded(
    retriever: &Retriever,
    analyzer: &Analyzer,
    request: &AnalysisRequest,
) -> Result<AnalysisResult> {
    let grounding = retriever.retrieve(&query_for_request(request)).await?;
    analyzer.analyze(request, Some(&grounding)).await
}

async fn judge_condition(
    judge: &Judge,
    scenario: &Scenario,
    stage: ScenarioState,
    outcome: RunOutcome,
) -> ConditionRecord {
    let analysis = match outcome {
        Ok(analysis) => analysis,
        Err((stage, err)) => {
            return ConditionRecord::Failed {
                stage,
                error: err.to_string(),
                analysis: None,
            }
        }
    };

    match judge
        .score(&scenario.request.subject, &scenario.description, &analysis)
        .await
    {
        Ok(scores) => {
            let expectations: Vec<ExpectationCheck> = scenario
                .expected
                .iter()
                .map(|&outcome| ExpectationCheck {
                    outcome,
                    met: outcome.is_met(&analysis),
                })
                .collect();
            for check in expectations.iter().filter(|c| !c.met) {
                warn!(
                    scenario = %scenario.id,
                    grounded = analysis.grounded,
                    expected = ?check.outcome,
                    "expected outcome not met"
                );
            }
            ConditionRecord::Scored {
                total: scores.total(),
                scores,
                expectations,
                analysis,
            }
        }
        Err(err) => {
            warn!(scenario = %scenario.id, error = %err, "judge failed");
            ConditionRecord::Failed {
                stage,
                error: err.to_string(),
                analysis: Some(analysis),
            }
        }
    }
}

/// Drive one scenario through every state. Never fails: errors are
/// recorded against the condition they belong to.
pub async fn run_scenario(
    retriever: &Retriever,
    analyzer: &Analyzer,
    judge: &Judge,
    scenario: &Scenario,
) -> ScenarioRecord {
    let mut state = ScenarioState::Pending;
    let request = &scenario.request;
    let advance = |state: &mut ScenarioState| {
        *state = state.next();
        debug!(scenario = %scenario.id, state = ?*state, "scenario state");
    };

    advance(&mut state);
    let grounded_run: RunOutcome = run_grounded(retriever, analyzer, request)
        .await
        .map_err(|e| (state, e));

    advance(&mut state);
    let ungrounded_run: RunOutcome = analyzer.analyze(request, None).await.map_err(|e| (state, e));

    advance(&mut state);
    let grounded = judge_condition(judge, scenario, state, grounded_run).await;

    advance(&mut state);
    let ungrounded = judge_condition(judge, scenario, state, ungrounded_run).await;

    advance(&mut state);
    let uplift = grounded
        .total()
        .zip(ungrounded.total())
        .map(|(g, u)| g as i64 - u as i64);
    info!(
        scenario = %scenario.id,
        grounded = ?grounded.total(),
        ungrounded = ?ungrounded.total(),
        "scenario scored"
    );

    ScenarioRecord {
        id: scenario.id.clone(),
        description: scenario.description.clone(),
        state,
        grounded,
        ungrounded,
        uplift,
    }
}

// ============ Output ============

/// Write `record` as a new JSON file under `dir` and return its path.
///
/// The file name carries the run timestamp and id; an existing file is
/// never replaced.
pub fn write_record(record: &RunRecord, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let short_id: String = record.run_id.chars().take(8).collect();
    let name = format!(
        "eval_{}_{}.json",
        record.timestamp.format("%Y%m%d_%H%M%S"),
        short_id
    );
    let path = dir.join(&name);
    if path.exists() {
        return Err(Error::Config(format!(
            "refusing to overwrite evaluation record {}",
            path.display()
        )));
    }

    let tmp = dir.join(format!(".{}.tmp", name));
    let json = serde_json::to_string_pretty(record)?;
    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut f| {
            f.write_all(json.as_bytes())?;
            f.sync_all()
        });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    std::fs::rename(&tmp, &path)?;
    info!(path = %path.display(), "wrote evaluation record");
    Ok(path)
}

fn score_cell(record: &ConditionRecord, max: u32) -> String {
    match record.total() {
        Some(t) => format!("{}/{}", t, max),
        None => "failed".to_string(),
    }
}

/// Render the per-scenario table and the run-level means.
pub fn render_summary(record: &RunRecord) -> String {
    let max = record.summary.max_total;
    let heavy = "═".repeat(64);
    let light = "─".repeat(64);
    let mut out = format!(
        "{}\nEVALUATION SUMMARY  model: {}  embeddings: {}\n{}\n{:<30} {:>9} {:>11} {:>8}\n{}\n",
        heavy,
        record.model,
        record.embedding_model_version,
        heavy,
        "Scenario",
        "Grounded",
        "Ungrounded",
        "Uplift",
        light
    );
    for s in &record.scenarios {
        let uplift = s
            .uplift
            .map(|u| format!("{:+}", u))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<30} {:>9} {:>11} {:>8}\n",
            s.id,
            score_cell(&s.grounded, max),
            score_cell(&s.ungrounded, max),
            uplift
        ));
    }
    let fmt_mean = |m: Option<f64>| {
        m.map(|v| format!("{:.1}/{}", v, max))
            .unwrap_or_else(|| "-".to_string())
    };
    out.push_str(&format!(
        "{}\n{:<30} {:>9} {:>11} {:>8}\n{}\n",
        light,
        "Mean",
        fmt_mean(record.summary.mean_grounded),
        fmt_mean(record.summary.mean_ungrounded),
        record
            .summary
            .delta
            .map(|d| format!("{:+.1}", d))
            .unwrap_or_else(|| "-".to_string()),
        heavy
    ));
    if record.summary.failed_conditions > 0 {
        out.push_str(&format!(
            "{} condition(s) failed; see the run record for errors\n",
            record.summary.failed_conditions
        ));
    }
    out
}
