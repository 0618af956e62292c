use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backends::{DynSearchBackend, DynTextGenerator};
use crate::citation::SourceRecord;
use crate::config::{CoverageMode, ResearchConfig};
use crate::coverage::DynCoverageJudge;
use crate::error::DeepQueryError;
use crate::events::EventCollector;
use crate::logging::{SessionLogInput, SessionLogger};
use crate::metrics;
use crate::model::{FinalAnswer, ResearchRequest, ResearchTopic, RoundSummary};
use crate::orchestrator::ResearchOrchestrator;
use crate::trace::{TraceSummary, is_valid_session_id, persist_trace};

fn new_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

/// Options for running a research session.
pub struct SessionOptions {
    topic: ResearchTopic,
    search: DynSearchBackend,
    generator: DynTextGenerator,
    research: ResearchConfig,
    session_id: Option<String>,
    trace_dir: Option<PathBuf>,
    events: Option<EventCollector>,
    cancel: CancellationToken,
    coverage: Option<CoverageMode>,
    judge: Option<DynCoverageJudge>,
    logger: Option<SessionLogger>,
}

impl SessionOptions {
    pub fn new(topic: ResearchTopic, search: DynSearchBackend, generator: DynTextGenerator) -> Self {
        Self {
            topic,
            search,
            generator,
            research: ResearchConfig::default(),
            session_id: None,
            trace_dir: None,
            events: None,
            cancel: CancellationToken::new(),
            coverage: None,
            judge: None,
            logger: None,
        }
    }

    pub fn with_research_config(mut self, research: ResearchConfig) -> Self {
        self.research = research;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Persist the session trace as `<dir>/<session_id>.json`.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the coverage mode from the research config.
    pub fn with_coverage(mut self, mode: CoverageMode) -> Self {
        self.coverage = Some(mode);
        self
    }

    /// Use a custom coverage judge; takes precedence over the coverage mode.
    pub fn with_judge(mut self, judge: DynCoverageJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Append a completion record through `logger` once the session ends.
    pub fn with_session_log(mut self, logger: SessionLogger) -> Self {
        self.logger = Some(logger);
        self
    }
}

/// Result of a successful session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub answer: FinalAnswer,
    pub rounds: Vec<RoundSummary>,
    pub sources: Vec<SourceRecord>,
    pub trace_summary: TraceSummary,
    pub trace_path: Option<PathBuf>,
}

/// Answer a request with default settings.
pub async fn run_research_session(
    request: &ResearchRequest,
    search: DynSearchBackend,
    generator: DynTextGenerator,
) -> Result<FinalAnswer, DeepQueryError> {
    let topic = ResearchTopic::from_request(request)?;
    run_research_session_with_options(SessionOptions::new(topic, search, generator))
        .await
        .map(|outcome| outcome.answer)
}

/// Run a session with explicit options (session id, trace output, progress
/// events, cancellation, coverage judge, completion log).
pub async fn run_research_session_with_options(
    options: SessionOptions,
) -> Result<SessionOutcome, DeepQueryError> {
    let session_id = options.session_id.unwrap_or_else(new_session_id);
    if !is_valid_session_id(&session_id) {
        return Err(DeepQueryError::InvalidConfiguration(format!(
            "session id {session_id:?} may only contain letters, digits, '-', '_' and inner dots"
        )));
    }
    let mut research = options.research;
    if let Some(mode) = options.coverage {
        research.coverage = mode;
    }

    let mut orchestrator = ResearchOrchestrator::new(options.search, options.generator, &research);
    if let Some(judge) = options.judge {
        orchestrator = orchestrator.with_judge(judge);
    }
    if let Some(events) = options.events {
        orchestrator = orchestrator.with_events(events);
    }

    let topic_text = options.topic.question().to_string();
    info!(%session_id, topic = %topic_text, "starting research session");

    let run = match orchestrator.run(options.topic, &options.cancel).await {
        Ok(run) => run,
        Err(err) => {
            let outcome = failure_label(&err);
            metrics::record_session(outcome);
            warn!(%session_id, error = %err, outcome, "research session ended without an answer");
            if let Some(logger) = &options.logger {
                write_log(
                    logger,
                    SessionLogInput {
                        session_id: session_id.clone(),
                        topic: topic_text,
                        outcome: outcome.to_string(),
                        rounds: 0,
                        queries: Vec::new(),
                        citations: Vec::new(),
                        answer_chars: 0,
                        trace_path: None,
                    },
                );
            }
            return Err(err);
        }
    };

    let trace_path = match &options.trace_dir {
        Some(dir) => match persist_trace(dir, &session_id, run.trace.events()) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%session_id, error = %err, "failed to persist trace");
                None
            }
        },
        None => None,
    };

    metrics::record_session("answered");
    if let Some(logger) = &options.logger {
        write_log(
            logger,
            SessionLogInput {
                session_id: session_id.clone(),
                topic: topic_text,
                outcome: "answered".to_string(),
                rounds: run.state.rounds().len() as u32,
                queries: run.state.issued_queries().to_vec(),
                citations: run.answer.citations_used.clone(),
                answer_chars: run.answer.markdown.chars().count(),
                trace_path: trace_path
                    .as_ref()
                    .map(|path| path.display().to_string()),
            },
        );
    }

    Ok(SessionOutcome {
        session_id,
        trace_summary: run.trace.summary(),
        sources: run.registry.records().to_vec(),
        rounds: run.state.rounds().to_vec(),
        answer: run.answer,
        trace_path,
    })
}

fn failure_label(err: &DeepQueryError) -> &'static str {
    match err {
        DeepQueryError::RoundFailure { .. } => "round_failure",
        DeepQueryError::Cancelled => "cancelled",
        DeepQueryError::FatalPlanning(_) => "planning_failure",
        _ => "error",
    }
}

fn write_log(logger: &SessionLogger, input: SessionLogInput) {
    if let Err(err) = logger.log_completion(input) {
        warn!(error = %err, "failed to write session log");
    }
}
