//! End-to-end pipeline tests: corpus → index → retrieval → analysis →
//! evaluation, with the offline hash embedder and a rule-based stand-in
//! for the language model.

use async_trait::async_trait;
use babytrack_rag::analyzer::Analyzer;
use babytrack_rag::config::{load_config, Config};
use babytrack_rag::embedding::{create_embedder, CachingEmbedder, Embedder};
use babytrack_rag::error::{Error, Result};
use babytrack_rag::eval::{builtin_scenarios, write_record, ConditionRecord, Harness, ScenarioState};
use babytrack_rag::indexer::{load_index, rebuild};
use babytrack_rag::judge::Judge;
use babytrack_rag::llm::{CompletionRequest, LanguageModel};
use babytrack_rag::models::{SectionName, NONE_NOTED};
use babytrack_rag::retriever::{query_for_request, Retriever};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Answers analysis prompts from the event summary it is given and judge
/// prompts from the analysis it is shown. Grounded prompts get citations.
struct GuidelineModel {
    calls: AtomicUsize,
}

impl GuidelineModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn analysis(prompt: &str) -> String {
        let mean: u32 = prompt
            .lines()
            .find_map(|l| l.strip_prefix("Mean per feed: "))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let grounded = prompt.contains("## Reference context");
        let cite = if grounded { " [1]" } else { "" };

        let (positive, concerns, recommendations) = if mean < 50 {
            (
                "Feeds are spread across the day.".to_string(),
                format!(
                    "Volumes average {} ml, below the expected range for this age{}. \
                     Contact a pediatrician about this.",
                    mean, cite
                ),
                "Consult a pediatrician promptly to check weight gain and feeding.".to_string(),
            )
        } else {
            (
                format!("Volumes around {} ml per feed match the recommendations{}.", mean, cite),
                NONE_NOTED.to_string(),
                format!("Keep feeding on demand{}.", cite),
            )
        };
        format!(
            "### Positive observations\n{}\n\n### Concerns\n{}\n\n### Recommendations\n{}\n\n### Summary\nMean intake {} ml per feed.",
            positive, concerns, recommendations, mean
        )
    }

    fn scores(prompt: &str) -> String {
        let grounding = if prompt.contains("### Sources") { 2 } else { 0 };
        format!(
            "```json\n{{\"structural_completeness\": {{\"score\": 2, \"rationale\": \"complete\"}}, \
             \"age_appropriateness\": {{\"score\": 2, \"rationale\": \"fits age\"}}, \
             \"grounding\": {{\"score\": {}, \"rationale\": \"sources\"}}, \
             \"safety\": {{\"score\": 2, \"rationale\": \"appropriate\"}}, \
             \"tone\": {{\"score\": 1, \"rationale\": \"a little terse\"}}}}\n```",
            grounding
        )
    }
}

#[async_trait]
impl LanguageModel for GuidelineModel {
    fn model_name(&self) -> &str {
        "guideline-stub"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.prompt.contains("Respond ONLY with a JSON object") {
            Ok(Self::scores(&request.prompt))
        } else if request.prompt.contains("## Requested analysis") {
            Ok(Self::analysis(&request.prompt))
        } else {
            Err(Error::permanent("unexpected prompt"))
        }
    }
}

fn setup(root: &Path) -> Config {
    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("sfp.md"),
        "+++\ntitle = \"Bottle feeding volumes by age\"\nsource = \"SFP\"\n+++\n\
         # Bottle feeding volumes by age\n\n\
         ## First week\n\nAt one week, bottle volume is 60 to 70 ml per feed, 6 to 8 feeds per day.\n\
         Less than 40 ml per feed should be assessed by a pediatrician.\n\n\
         ## Two to three months\n\nBetween two and three months, 130 to 150 ml per feed, 5 feeds per day.\n",
    )
    .unwrap();
    fs::write(
        docs.join("who.md"),
        "+++\ntitle = \"Infant and young child feeding\"\nsource = \"WHO\"\n+++\n\
         ## Breastfeeding\n\nBreastfeed on demand, 8 to 12 times in 24 hours.\n\n\
         ## Formula feeding\n\nA newborn of one week typically takes 60 to 90 ml per feed of formula.\n",
    )
    .unwrap();
    fs::write(
        docs.join("rhythm.md"),
        "# Feeding rhythm\n\n## Night feeds\n\nNewborns need night feeds; from two months a longer stretch is normal.\n",
    )
    .unwrap();

    let config_path = root.join("btrag.toml");
    fs::write(
        &config_path,
        format!(
            r#"[corpus]
dir = "{root}/docs"

[chunking]
max_tokens = 40
overlap_tokens = 8

[embedding]
provider = "hash"
dims = 128

[index]
path = "{root}/index/btrag.sqlite"

[retrieval]
top_k = 3
max_context_chars = 4000

[llm]
retry_backoff_ms = 0

[eval]
output_dir = "{root}/results"
concurrency = 2
"#,
            root = root.display()
        ),
    )
    .unwrap();
    load_config(&config_path).unwrap()
}

async fn retriever(cfg: &Config) -> Retriever {
    let embedder: Arc<dyn Embedder> = create_embedder(&cfg.embedding).unwrap();
    let index = load_index(cfg, embedder.as_ref()).await.unwrap();
    Retriever::new(Arc::new(index), embedder, &cfg.retrieval).unwrap()
}

#[tokio::test]
async fn test_build_publish_and_reload() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();

    let (built, stats) = rebuild(&cfg, embedder.as_ref()).await.unwrap();
    assert_eq!(stats.documents, 3);
    assert!(stats.chunks >= 3);
    assert!(cfg.index.path.is_file());

    let loaded = load_index(&cfg, embedder.as_ref()).await.unwrap();
    let query = babytrack_rag::embedding::embed_query(embedder.as_ref(), "bottle volume one week")
        .await
        .unwrap();
    let before = built.query(&query, 5).unwrap();
    let after = loaded.query(&query, 5).unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.chunk, b.chunk);
        assert_eq!(a.score, b.score);
    }

    // A rebuild with identical inputs yields identical chunks and vectors.
    let (again, _) = rebuild(&cfg, embedder.as_ref()).await.unwrap();
    assert_eq!(again.entries(), built.entries());
}

#[tokio::test]
async fn test_changed_chunking_policy_rejects_artifact() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    cfg.chunking.max_tokens = 80;
    let err = load_index(&cfg, embedder.as_ref()).await.unwrap_err();
    assert!(matches!(err, Error::IndexMismatch { field: "chunking.max_tokens", .. }));
}

#[tokio::test]
async fn test_retrieval_is_ranked_and_bounded() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    let r = retriever(&cfg).await;
    let request = &builtin_scenarios()[0].request;
    let grounding = r.retrieve(&query_for_request(request)).await.unwrap();

    assert!(!grounding.is_empty());
    assert!(grounding.passages.len() <= cfg.retrieval.top_k);
    for pair in grounding.passages.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(grounding.context.starts_with("[1] "));
    assert!(grounding.context.chars().count() <= cfg.retrieval.max_context_chars);
    assert!(!grounding.citations.is_empty());
}

#[tokio::test]
async fn test_normal_newborn_grounded_has_no_concerns_and_cites() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    let r = retriever(&cfg).await;
    let analyzer = Analyzer::new(GuidelineModel::new(), &cfg.llm, &cfg.analysis);
    let request = &builtin_scenarios()[0].request;
    let grounding = r.retrieve(&query_for_request(request)).await.unwrap();

    let grounded = analyzer.analyze(request, Some(&grounding)).await.unwrap();
    assert!(grounded.grounded);
    assert!(grounded.is_none_noted(SectionName::Concerns));
    assert!(!grounded.citations.is_empty());
    assert_eq!(grounded.citations[0], grounding.citation(1).unwrap());

    let ungrounded = analyzer.analyze(request, None).await.unwrap();
    assert!(!ungrounded.grounded);
    for (_, text) in ungrounded.sections.iter() {
        assert!(!text.trim().is_empty());
    }
}

#[tokio::test]
async fn test_low_volume_newborn_raises_concern_and_referral() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    let r = retriever(&cfg).await;
    let analyzer = Analyzer::new(GuidelineModel::new(), &cfg.llm, &cfg.analysis);
    let request = &builtin_scenarios()[1].request;
    let grounding = r.retrieve(&query_for_request(request)).await.unwrap();
    let result = analyzer.analyze(request, Some(&grounding)).await.unwrap();

    assert!(!result.is_none_noted(SectionName::Concerns));
    assert!(result
        .sections
        .get(SectionName::Concerns)
        .to_lowercase()
        .contains("pediatrician"));
}

#[tokio::test]
async fn test_eval_run_scores_both_conditions_and_writes_record() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let base = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, base.as_ref()).await.unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(CachingEmbedder::new(base));
    let index = load_index(&cfg, embedder.as_ref()).await.unwrap();
    let retriever = Retriever::new(Arc::new(index), embedder, &cfg.retrieval).unwrap();
    let model = GuidelineModel::new();
    let harness = Harness::new(
        Arc::new(retriever),
        Arc::new(Analyzer::new(model.clone(), &cfg.llm, &cfg.analysis)),
        Arc::new(Judge::new(model.clone(), &cfg.llm)),
        cfg.eval.concurrency,
    );

    let record = harness.run(builtin_scenarios()).await;
    assert_eq!(record.scenarios.len(), 3);
    assert_eq!(record.model, "guideline-stub");
    assert_eq!(record.embedding_model_version, "hash:default");
    // Two analyses and two judge calls per scenario.
    assert_eq!(model.calls.load(Ordering::SeqCst), 12);

    for s in &record.scenarios {
        assert_eq!(s.state, ScenarioState::Scored);
        match &s.grounded {
            ConditionRecord::Scored { total, expectations, .. } => {
                assert_eq!(*total, 9);
                assert!(expectations.iter().all(|c| c.met), "{}: {:?}", s.id, expectations);
            }
            other => panic!("{} grounded failed: {:?}", s.id, other),
        }
        assert_eq!(s.ungrounded.total(), Some(7));
        assert_eq!(s.uplift, Some(2));
    }
    assert_eq!(record.summary.mean_grounded, Some(9.0));
    assert_eq!(record.summary.mean_ungrounded, Some(7.0));
    assert_eq!(record.summary.delta, Some(2.0));

    let path = write_record(&record, &cfg.eval.output_dir).unwrap();
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["scenarios"][0]["grounded"]["status"], "scored");
    assert_eq!(
        json["scenarios"][0]["grounded"]["scores"]["criteria"]["tone"]["rationale"],
        "a little terse"
    );
    assert!(json["scenarios"][0]["grounded"]["scores"]["raw_reply"]
        .as_str()
        .unwrap()
        .starts_with("```json\n"));
}

#[tokio::test]
async fn test_judge_failure_is_recorded_not_fatal() {
    struct NoJudge(Arc<GuidelineModel>);

    #[async_trait]
    impl LanguageModel for NoJudge {
        fn model_name(&self) -> &str {
            "no-judge"
        }
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            if request.prompt.contains("Respond ONLY with a JSON object") {
                Ok("I would rather not score this.".to_string())
            } else {
                self.0.complete(request).await
            }
        }
    }

    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    let model: Arc<dyn LanguageModel> = Arc::new(NoJudge(GuidelineModel::new()));
    let harness = Harness::new(
        Arc::new(retriever(&cfg).await),
        Arc::new(Analyzer::new(model.clone(), &cfg.llm, &cfg.analysis)),
        Arc::new(Judge::new(model, &cfg.llm)),
        1,
    );
    let record = harness.run(builtin_scenarios()).await;

    assert_eq!(record.scenarios.len(), 3);
    assert_eq!(record.summary.failed_conditions, 6);
    assert!(record.summary.delta.is_none());
    match &record.scenarios[0].grounded {
        ConditionRecord::Failed { stage, analysis, .. } => {
            assert_eq!(*stage, ScenarioState::JudgeGrounded);
            assert!(analysis.is_some());
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_grounded_run_failure_keeps_ungrounded_scored() {
    struct NoGroundedAnalysis(Arc<GuidelineModel>);

    #[async_trait]
    impl LanguageModel for NoGroundedAnalysis {
        fn model_name(&self) -> &str {
            "no-grounded-analysis"
        }
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            if request.prompt.contains("## Reference context") {
                Err(Error::permanent("context window exceeded"))
            } else {
                self.0.complete(request).await
            }
        }
    }

    let tmp = TempDir::new().unwrap();
    let cfg = setup(tmp.path());
    let embedder = create_embedder(&cfg.embedding).unwrap();
    rebuild(&cfg, embedder.as_ref()).await.unwrap();

    let inner = GuidelineModel::new();
    let model: Arc<dyn LanguageModel> = Arc::new(NoGroundedAnalysis(inner.clone()));
    let harness = Harness::new(
        Arc::new(retriever(&cfg).await),
        Arc::new(Analyzer::new(model.clone(), &cfg.llm, &cfg.analysis)),
        Arc::new(Judge::new(model, &cfg.llm)),
        2,
    );
    let record = harness.run(builtin_scenarios()).await;

    assert_eq!(record.scenarios.len(), 3);
    assert_eq!(record.summary.failed_conditions, 3);
    assert!(record.summary.mean_grounded.is_none());
    assert_eq!(record.summary.mean_ungrounded, Some(7.0));
    assert!(record.summary.delta.is_none());
    // Only the ungrounded analysis and its judging reach the inner model.
    assert_eq!(inner.calls.load(Ordering::SeqCst), 6);

    for s in &record.scenarios {
        match &s.grounded {
            ConditionRecord::Failed { stage, error, analysis } => {
                assert_eq!(*stage, ScenarioState::RunGrounded);
                assert!(error.contains("context window exceeded"), "{}", error);
                assert!(analysis.is_none());
            }
            other => panic!("{} grounded should have failed: {:?}", s.id, other),
        }
        assert_eq!(s.ungrounded.total(), Some(7));
        assert!(s.uplift.is_none());
    }
}
