//! DeepQuery core: a deep-research orchestrator that plans search queries,
//! retrieves and summarizes results with tracked provenance, decides when
//! coverage is sufficient and synthesizes a cited answer.
//!
//! Search and text generation are consumed through the [`SearchBackend`] and
//! [`TextGenerator`] traits; [`run_research_session_with_options`] is the
//! entry point for request handlers.

pub mod backends;
pub mod citation;
pub mod config;
pub mod coverage;
mod error;
pub mod events;
mod logging;
pub mod metrics;
mod model;
pub mod orchestrator;
pub mod planner;
pub mod retrieval;
mod security;
pub mod synthesizer;
mod telemetry;
mod text;
mod trace;
mod workflow;

pub use backends::{
    CorpusDocument, DynSearchBackend, DynTextGenerator, HttpSearchBackend,
    OpenAiCompatibleGenerator, ScriptedGenerator, SearchBackend, SearchHit, StaticSearchBackend,
    TextGenerator,
};
pub use citation::{CitationRegistry, DomainLabeler, LabelStrategy, SourceRecord};
pub use config::{Config, ConfigLoader, CoverageMode, ResearchConfig};
pub use coverage::{
    CoverageController, CoverageJudge, Decision, GenerativeCoverage, KeywordCoverage, Phase,
    ResearchState, StopReason,
};
pub use error::{
    DeepQueryError, PlanningError, RetrievalFailure, RetrievalFailureKind, SearchError,
};
pub use events::{EventCollector, EventKind, ResearchEvent};
pub use logging::{SessionLogInput, SessionLogger, log_session_completion, remove_session_logs};
pub use model::{
    FinalAnswer, MAX_QUERY_CHARS, Query, QuerySummary, ResearchRequest, ResearchTopic,
    RoundSummary,
};
pub use orchestrator::{ResearchOrchestrator, ResearchRun};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{
    SessionOptions, SessionOutcome, run_research_session, run_research_session_with_options,
};
