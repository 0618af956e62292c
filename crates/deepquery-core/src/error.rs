use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Core error type for DeepQuery sessions.
#[derive(Debug, Error)]
pub enum DeepQueryError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid research topic: {0}")]
    InvalidTopic(String),
    #[error("query planning failed after retry: {0}")]
    FatalPlanning(#[source] PlanningError),
    #[error("every query in round {round} failed ({} failures)", .failures.len())]
    RoundFailure {
        round: u32,
        failures: Vec<RetrievalFailure>,
    },
    #[error("answer cites unregistered labels: {}", .labels.join(", "))]
    CitationIntegrity { labels: Vec<String> },
    #[error("budget exceeded: {attempted} dispatches requested, ceiling is {ceiling}")]
    BudgetExceeded { attempted: usize, ceiling: usize },
    #[error("illegal phase transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::coverage::Phase,
        to: crate::coverage::Phase,
    },
    #[error("research session cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepQueryError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    /// Only total retrieval failure and cancellation are surfaced to end users;
    /// everything else is an operator concern.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::RoundFailure { .. } | Self::Cancelled)
    }
}

/// Recoverable failure to turn generator output into a query plan.
#[derive(Debug, Clone, Error)]
pub enum PlanningError {
    #[error("text generation failed: {0}")]
    Generation(String),
    #[error("planner output is not valid JSON: {0}")]
    Unparsable(String),
    #[error("planner output violates schema: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalFailureKind {
    Timeout,
    Empty,
    Backend,
}

/// Per-query retrieval failure. Absorbed into an empty summary, never escalated
/// on its own.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetrievalFailure {
    pub query: String,
    pub kind: RetrievalFailureKind,
    pub reason: String,
}

impl RetrievalFailure {
    pub fn new(
        query: impl Into<String>,
        kind: RetrievalFailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RetrievalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RetrievalFailureKind::Timeout => "timeout",
            RetrievalFailureKind::Empty => "empty result set",
            RetrievalFailureKind::Backend => "backend error",
        };
        write!(f, "{kind} for \"{}\": {}", self.query, self.reason)
    }
}

impl std::error::Error for RetrievalFailure {}

/// Error raised by a search backend.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("transient search failure: {0}")]
    Transient(String),
    #[error("search backend error: {0}")]
    Backend(String),
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_round_failure_and_cancel_are_user_visible() {
        assert!(DeepQueryError::Cancelled.is_user_visible());
        assert!(
            DeepQueryError::RoundFailure {
                round: 1,
                failures: vec![]
            }
            .is_user_visible()
        );
        assert!(
            !DeepQueryError::CitationIntegrity {
                labels: vec!["made_up".into()]
            }
            .is_user_visible()
        );
        assert!(
            !DeepQueryError::FatalPlanning(PlanningError::Unparsable("x".into()))
                .is_user_visible()
        );
    }

    #[test]
    fn retrieval_failure_display_names_kind() {
        let failure = RetrievalFailure::new("rust async", RetrievalFailureKind::Timeout, "20s");
        assert_eq!(failure.to_string(), "timeout for \"rust async\": 20s");
    }
}
