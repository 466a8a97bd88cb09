//! # BabyTrack RAG CLI (`btrag`)
//!
//! The `btrag` binary builds and inspects the reference index, runs
//! retrieval and analysis, and drives the evaluation harness.
//!
//! ## Usage
//!
//! ```bash
//! btrag --config ./config/btrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `btrag index build` | Chunk and embed the corpus, publish the index artifact |
//! | `btrag index info` | Show the published artifact's tag and contents |
//! | `btrag retrieve "<intent>"` | Print the grounding context for a query |
//! | `btrag analyze --request <file>` | Analyze a feeding window (JSON) |
//! | `btrag eval run` | Score grounded vs ungrounded analyses |
//!
//! Logging goes to stderr. Set `BTRAG_LOG` (e.g. `BTRAG_LOG=debug`) to
//! override the `-v`/`-q` flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use babytrack_rag::{commands, config};

/// BabyTrack RAG: retrieval-grounded infant feeding analysis.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/btrag.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "btrag",
    about = "BabyTrack RAG — retrieval-grounded infant feeding analysis",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/btrag.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or inspect the reference index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Retrieve grounding passages for a query.
    ///
    /// Embeds the query with the configured embedder and prints the
    /// top-k passages in the format handed to the model.
    Retrieve {
        /// Free-text intent, e.g. "bottle volume per feed".
        intent: String,

        /// Subject age in days.
        #[arg(long)]
        age_days: Option<u32>,

        /// Event type to bias retrieval toward (repeatable).
        #[arg(long = "event-type")]
        event_types: Vec<String>,
    },

    /// Analyze a feeding window.
    ///
    /// Reads an analysis request (subject, events, period) as JSON and
    /// prints the four analysis sections followed by the cited sources.
    Analyze {
        /// Path to the analysis request JSON.
        #[arg(long)]
        request: PathBuf,

        /// Skip retrieval and analyze without reference context.
        #[arg(long)]
        ungrounded: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the evaluation harness.
    Eval {
        #[command(subcommand)]
        action: EvalAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from the corpus and atomically publish it.
    Build,
    /// Show the published index's tag, counts, and documents.
    Info,
}

#[derive(Subcommand)]
enum EvalAction {
    /// Run every scenario grounded and ungrounded, judge both, and write
    /// the run record.
    Run,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("BTRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Build => commands::run_index_build(&cfg).await?,
            IndexAction::Info => commands::run_index_info(&cfg).await?,
        },
        Commands::Retrieve {
            intent,
            age_days,
            event_types,
        } => {
            commands::run_retrieve(&cfg, &intent, age_days, event_types).await?;
        }
        Commands::Analyze {
            request,
            ungrounded,
            json,
        } => {
            commands::run_analyze(&cfg, &request, ungrounded, json).await?;
        }
        Commands::Eval { action } => match action {
            EvalAction::Run => commands::run_eval(&cfg).await?,
        },
    }

    Ok(())
}
