//! Progress events emitted while a session runs.
//!
//! Consumers (the CLI, tests, a request handler streaming progress) hold the
//! receiving end of an unbounded channel; emitting never blocks the driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::coverage::StopReason;
use crate::error::RetrievalFailureKind;

pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchEvent {
    pub event_id: EventId,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RoundStarted {
        round: u32,
    },
    PlanReady {
        round: u32,
        rationale: String,
        queries: Vec<String>,
    },
    QuerySettled {
        round: u32,
        query: String,
        outcome: QueryOutcomeStatus,
        duration_ms: u64,
    },
    CoverageDecision {
        round: u32,
        continue_search: bool,
        gaps: Vec<String>,
        stop_reason: Option<StopReason>,
    },
    AnswerReady {
        citations: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcomeStatus {
    Success { sources: Vec<String> },
    Failed { kind: RetrievalFailureKind, reason: String },
}

impl EventKind {
    /// Short step name and a one-line description, as shown in traces.
    pub fn describe(&self) -> (&'static str, String) {
        match self {
            EventKind::RoundStarted { round } => ("round", format!("round {round} started")),
            EventKind::PlanReady { queries, .. } => (
                "planner",
                format!("{} queries: {}", queries.len(), queries.join(" | ")),
            ),
            EventKind::QuerySettled { query, outcome, .. } => match outcome {
                QueryOutcomeStatus::Success { sources } => (
                    "retrieval",
                    format!("\"{query}\" -> {}", sources.join(", ")),
                ),
                QueryOutcomeStatus::Failed { kind, reason } => (
                    "retrieval",
                    format!("\"{query}\" failed ({kind:?}): {reason}"),
                ),
            },
            EventKind::CoverageDecision {
                continue_search,
                gaps,
                stop_reason,
                ..
            } => {
                let message = if *continue_search {
                    format!("continue; gaps: {}", gaps.join("; "))
                } else {
                    format!("stop ({:?})", stop_reason.unwrap_or(StopReason::Covered))
                };
                ("coverage", message)
            }
            EventKind::AnswerReady { citations } => (
                "synthesizer",
                format!("answer cites {}", citations.join(", ")),
            ),
        }
    }
}

/// Sending half of the progress channel.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<ResearchEvent>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResearchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, kind: EventKind) {
        let event = ResearchEvent {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
        };
        if let Err(err) = self.sender.send(event) {
            tracing::debug!(error = %err, "progress receiver dropped; event discarded");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

fn generate_event_id() -> EventId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("evt_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
