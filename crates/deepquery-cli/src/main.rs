use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deepquery_core::{
    ConfigLoader, CorpusDocument, CoverageMode, DynSearchBackend, EventCollector,
    HttpSearchBackend, OpenAiCompatibleGenerator, ResearchTopic, SessionLogger, SessionOptions,
    StaticSearchBackend, TelemetryOptions, init_telemetry, metrics, remove_session_logs,
    run_research_session_with_options,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "deepquery-cli",
    version,
    about = "Multi-round web research with cited answers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a topic and print the cited answer.
    Run(RunArgs),
    /// Delete every session log record of a session.
    Forget(ForgetArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CoverageArg {
    Keyword,
    Generative,
}

impl From<CoverageArg> for CoverageMode {
    fn from(value: CoverageArg) -> Self {
        match value {
            CoverageArg::Keyword => CoverageMode::Keyword,
            CoverageArg::Generative => CoverageMode::Generative,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question to research.
    #[arg(long)]
    topic: String,

    /// Search queries per round (defaults to `research.number_queries`).
    #[arg(long)]
    number_queries: Option<usize>,

    /// Maximum search rounds (defaults to `research.max_rounds`).
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Language of the final answer; defaults to the topic's language.
    #[arg(long)]
    language: Option<String>,

    /// Path to the TOML configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of JSON documents to search instead of the configured endpoint.
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Directory receiving `<session>.json` traces.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Coverage judge deciding whether another round is needed.
    #[arg(long, value_enum)]
    coverage: Option<CoverageArg>,

    /// Optional session ID (a UUID is generated otherwise).
    #[arg(long)]
    session: Option<String>,

    /// Print the round-by-round trace after the answer.
    #[arg(long, default_value_t = false)]
    show_trace: bool,

    /// Skip the session completion log.
    #[arg(long, default_value_t = false)]
    no_log: bool,
}

#[derive(Args, Debug)]
struct ForgetArgs {
    /// Session ID whose log records should be removed.
    #[arg(long)]
    session: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await?,
            Command::Forget(args) => forget_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load(args.config.clone())?;
    init_telemetry(TelemetryOptions::from_level(&config.logging.level))?;
    metrics::init_metrics_from_env("deepquery-cli");

    let http = reqwest::Client::new();
    let generator = Arc::new(OpenAiCompatibleGenerator::from_config(http.clone(), &config)?);
    let search: DynSearchBackend = match &args.corpus {
        Some(dir) => {
            let documents = load_corpus(dir)?;
            info!(documents = documents.len(), dir = %dir.display(), "using offline corpus");
            Arc::new(
                StaticSearchBackend::from_corpus(documents)
                    .with_max_results(config.search.max_results),
            )
        }
        None => Arc::new(HttpSearchBackend::from_config(http, &config)?),
    };

    let research = config.research.clone();
    let mut topic = ResearchTopic::new(
        args.topic.clone(),
        args.number_queries.unwrap_or(research.number_queries),
        args.max_rounds.unwrap_or(research.max_rounds),
    )?;
    if let Some(language) = &args.language {
        topic = topic.with_response_language(language);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling research session");
            on_signal.cancel();
        }
    });

    let (events, mut receiver) = EventCollector::new();
    let progress = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let (step, message) = event.kind.describe();
            info!(step, "{message}");
        }
    });

    let mut options = SessionOptions::new(topic, search, generator)
        .with_research_config(research)
        .with_cancellation(cancel)
        .with_events(events);
    if let Some(session_id) = args.session {
        options = options.with_session_id(session_id);
    }
    if let Some(dir) = args.trace_dir {
        options = options.with_trace_dir(dir);
    }
    if let Some(coverage) = args.coverage {
        options = options.with_coverage(coverage.into());
    }
    if !args.no_log {
        options = options.with_session_log(SessionLogger::from_env());
    }

    let result = run_research_session_with_options(options).await;
    progress.await.ok();
    let outcome = result?;

    println!("{}", outcome.answer.markdown);
    if !outcome.answer.citations_used.is_empty() {
        println!();
        for label in &outcome.answer.citations_used {
            if let Some(source) = outcome.sources.iter().find(|source| &source.label == label) {
                println!("[{label}]: {}", source.url);
            }
        }
    }
    if args.show_trace {
        println!("\n{}", outcome.trace_summary.render_markdown());
    }
    if let Some(path) = outcome.trace_path {
        info!(session = %outcome.session_id, path = %path.display(), "trace written");
    }
    Ok(())
}

fn forget_command(args: ForgetArgs) -> Result<()> {
    let removed = remove_session_logs(&args.session)
        .with_context(|| format!("failed to remove logs of session {}", args.session))?;
    println!("removed {removed} log records for session {}", args.session);
    Ok(())
}

/// Read every `*.json` file below `dir`; each holds one document or an array.
fn load_corpus(dir: &Path) -> Result<Vec<CorpusDocument>> {
    if !dir.is_dir() {
        bail!("corpus path {} is not a directory", dir.display());
    }

    let mut documents = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("json")
        {
            continue;
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read corpus file {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("corpus file {} is not valid JSON", path.display()))?;
        if value.is_array() {
            let batch: Vec<CorpusDocument> = serde_json::from_value(value)
                .with_context(|| format!("unexpected document shape in {}", path.display()))?;
            documents.extend(batch);
        } else {
            let document: CorpusDocument = serde_json::from_value(value)
                .with_context(|| format!("unexpected document shape in {}", path.display()))?;
            documents.push(document);
        }
    }

    if documents.is_empty() {
        bail!("no documents found under {}", dir.display());
    }
    Ok(documents)
}
