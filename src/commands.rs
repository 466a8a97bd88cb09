//! Command handlers behind the `btrag` binary.
//!
//! Each handler loads what it needs from the configuration, runs one
//! pipeline operation, and prints its result to stdout. Diagnostics go
//! through `tracing` to stderr.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::embedding::{create_embedder, CachingEmbedder, Embedder};
use crate::eval::{builtin_scenarios, load_scenarios, render_summary, write_record, Harness};
use crate::indexer::{expected_params, load_index, rebuild};
use crate::judge::Judge;
use crate::llm::create_model;
use crate::models::{AnalysisRequest, Query};
use crate::persist;
use crate::retriever::{query_for_request, Retriever};

async fn open_retriever(cfg: &Config, embedder: Arc<dyn Embedder>) -> Result<Retriever> {
    let index = load_index(cfg, embedder.as_ref()).await?;
    Ok(Retriever::new(Arc::new(index), embedder, &cfg.retrieval)?)
}

/// `btrag index build`
pub async fn run_index_build(cfg: &Config) -> Result<()> {
    let embedder = create_embedder(&cfg.embedding)?;
    let (_, stats) = rebuild(cfg, embedder.as_ref()).await?;

    println!("index build");
    println!("  documents: {}", stats.documents);
    println!("  chunks: {}", stats.chunks);
    println!("  model: {}", stats.model_version);
    println!("  path: {}", stats.path.display());
    Ok(())
}

/// `btrag index info`
pub async fn run_index_info(cfg: &Config) -> Result<()> {
    let tag = persist::read_tag(&cfg.index.path).await?;
    let index = persist::load(&cfg.index.path, &tag.params).await?;

    println!("--- Index ---");
    println!("path:           {}", cfg.index.path.display());
    println!("built_at:       {}", tag.built_at.to_rfc3339());
    println!("model:          {}", tag.params.model_version);
    println!("dims:           {}", tag.params.dims);
    println!("metric:         {}", tag.params.metric.as_str());
    println!(
        "chunking:       max_tokens={} overlap_tokens={}",
        tag.params.chunking.max_tokens, tag.params.chunking.overlap_tokens
    );
    println!("documents:      {}", index.documents().len());
    println!("chunks:         {}", index.len());

    let status = match create_embedder(&cfg.embedding) {
        Ok(embedder) => match tag.params.ensure_matches(&expected_params(cfg, embedder.as_ref())) {
            Ok(()) => "current".to_string(),
            Err(e) => format!("stale ({})", e),
        },
        Err(e) => format!("unknown ({})", e),
    };
    println!("status:         {}", status);
    println!();

    println!("--- Documents ({}) ---", index.documents().len());
    for doc in index.documents() {
        let chunks = index
            .entries()
            .iter()
            .filter(|e| e.chunk.document_id == doc.id)
            .count();
        println!("{}  [{}] {} ({} chunks)", doc.id, doc.source, doc.title, chunks);
    }
    Ok(())
}

/// `btrag retrieve "<intent>"`
pub async fn run_retrieve(
    cfg: &Config,
    intent: &str,
    age_days: Option<u32>,
    event_types: Vec<String>,
) -> Result<()> {
    let retriever = open_retriever(cfg, create_embedder(&cfg.embedding)?).await?;
    let grounding = retriever
        .retrieve(&Query {
            age_days,
            event_types,
            intent: intent.to_string(),
        })
        .await?;

    if grounding.is_empty() {
        println!("No results.");
        return Ok(());
    }
    println!("{}", grounding.context);
    println!();
    println!("--- Sources ({}) ---", grounding.citations.len());
    for c in &grounding.citations {
        match &c.section {
            Some(section) => println!("{} — {} ({})", c.document_title, section, c.document_id),
            None => println!("{} ({})", c.document_title, c.document_id),
        }
    }
    Ok(())
}

/// `btrag analyze --request <file>`
pub async fn run_analyze(cfg: &Config, request_path: &Path, ungrounded: bool, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request file: {}", request_path.display()))?;
    let request: AnalysisRequest =
        serde_json::from_str(&raw).with_context(|| "Failed to parse analysis request")?;

    let analyzer = Analyzer::new(create_model(&cfg.llm)?, &cfg.llm, &cfg.analysis);
    let grounding = if ungrounded {
        None
    } else {
        let retriever = open_retriever(cfg, create_embedder(&cfg.embedding)?).await?;
        Some(retriever.retrieve(&query_for_request(&request)).await?)
    };

    let result = analyzer.analyze(&request, grounding.as_ref()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.to_markdown());
    }
    Ok(())
}

/// `btrag eval run`
pub async fn run_eval(cfg: &Config) -> Result<()> {
    let scenarios = match &cfg.eval.scenarios {
        Some(path) => load_scenarios(path)?,
        None => builtin_scenarios(),
    };

    let embedder: Arc<dyn Embedder> = Arc::new(CachingEmbedder::new(create_embedder(&cfg.embedding)?));
    let retriever = open_retriever(cfg, embedder).await?;
    let model = create_model(&cfg.llm)?;
    let harness = Harness::new(
        Arc::new(retriever),
        Arc::new(Analyzer::new(model.clone(), &cfg.llm, &cfg.analysis)),
        Arc::new(Judge::new(model, &cfg.llm)),
        cfg.eval.concurrency,
    );

    let record = harness.run(scenarios).await;
    let path = write_record(&record, &cfg.eval.output_dir)?;

    print!("{}", render_summary(&record));
    println!("Full results saved to: {}", path.display());
    Ok(())
}
