//! Value types that flow between the planner, executor, controller and
//! synthesizer.

use serde::{Deserialize, Serialize};

use crate::error::{DeepQueryError, RetrievalFailure};

/// Default ceiling on a single search query, in characters.
pub const MAX_QUERY_CHARS: usize = 300;

/// Session input as received from a request handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub research_topic: String,
    pub number_queries: usize,
    pub max_rounds: u32,
    #[serde(default)]
    pub response_language: Option<String>,
}

/// Immutable description of what the session researches and within which budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTopic {
    question: String,
    response_language: Option<String>,
    max_rounds: u32,
    number_queries: usize,
}

impl ResearchTopic {
    pub fn new(
        question: impl Into<String>,
        number_queries: usize,
        max_rounds: u32,
    ) -> Result<Self, DeepQueryError> {
        let question = question.into().trim().to_string();
        if question.is_empty() {
            return Err(DeepQueryError::InvalidTopic(
                "research topic must not be empty".into(),
            ));
        }
        if number_queries == 0 {
            return Err(DeepQueryError::InvalidTopic(
                "number_queries must be at least 1".into(),
            ));
        }
        if max_rounds == 0 {
            return Err(DeepQueryError::InvalidTopic(
                "max_rounds must be at least 1".into(),
            ));
        }

        Ok(Self {
            question,
            response_language: None,
            max_rounds,
            number_queries,
        })
    }

    pub fn with_response_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        if !language.trim().is_empty() {
            self.response_language = Some(language.trim().to_string());
        }
        self
    }

    pub fn from_request(request: &ResearchRequest) -> Result<Self, DeepQueryError> {
        let topic = Self::new(
            request.research_topic.clone(),
            request.number_queries,
            request.max_rounds,
        )?;
        Ok(match request.response_language.as_deref() {
            Some(language) => topic.with_response_language(language),
            None => topic,
        })
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn response_language(&self) -> Option<&str> {
        self.response_language.as_deref()
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn number_queries(&self) -> usize {
        self.number_queries
    }

    /// Hard ceiling of outbound search dispatches for a session.
    pub fn dispatch_ceiling(&self) -> usize {
        (self.max_rounds as usize).saturating_mul(self.number_queries)
    }
}

/// A search string issued in a specific round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    text: String,
    rationale: String,
    round: u32,
}

impl Query {
    /// Build a query, truncating `text` to `max_chars` characters.
    pub fn new(text: &str, rationale: impl Into<String>, round: u32, max_chars: usize) -> Self {
        Self {
            text: truncate_chars(text.trim(), max_chars),
            rationale: rationale.into(),
            round,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn round(&self) -> u32 {
        self.round
    }
}

/// Result of one query in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySummary {
    pub query: Query,
    /// Labels of the sources this summary cites, in citation order.
    pub sources: Vec<String>,
    pub content: String,
    pub failure: Option<RetrievalFailure>,
}

impl QuerySummary {
    pub fn failed(query: Query, failure: RetrievalFailure) -> Self {
        Self {
            query,
            sources: Vec::new(),
            content: String::new(),
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Everything one round produced; appended to the session and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub rationale: String,
    pub results: Vec<QuerySummary>,
}

impl RoundSummary {
    pub fn successful(&self) -> impl Iterator<Item = &QuerySummary> {
        self.results.iter().filter(|result| result.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RetrievalFailure> {
        self.results
            .iter()
            .filter_map(|result| result.failure.as_ref())
    }

    pub fn all_failed(&self) -> bool {
        self.results.iter().all(|result| !result.is_success())
    }
}

/// The cited answer a session terminates with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub markdown: String,
    pub citations_used: Vec<String>,
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_rejects_zero_budgets() {
        assert!(ResearchTopic::new("rust", 0, 1).is_err());
        assert!(ResearchTopic::new("rust", 1, 0).is_err());
        assert!(ResearchTopic::new("   ", 1, 1).is_err());
    }

    #[test]
    fn topic_ceiling_is_rounds_times_queries() {
        let topic = ResearchTopic::new("rust", 3, 2).unwrap();
        assert_eq!(topic.dispatch_ceiling(), 6);
    }

    #[test]
    fn huge_query_budget_saturates_ceiling() {
        let topic = ResearchTopic::new("x", usize::MAX, 2).unwrap();
        assert_eq!(topic.dispatch_ceiling(), usize::MAX);
    }

    #[test]
    fn request_language_is_carried() {
        let request = ResearchRequest {
            research_topic: "Dendritic cells".into(),
            number_queries: 2,
            max_rounds: 1,
            response_language: Some("German".into()),
        };
        let topic = ResearchTopic::from_request(&request).unwrap();
        assert_eq!(topic.response_language(), Some("German"));
    }

    #[test]
    fn query_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        let query = Query::new(&long, "r", 1, MAX_QUERY_CHARS);
        assert_eq!(query.text().chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn round_with_only_failures_is_all_failed() {
        let query = Query::new("q", "r", 1, MAX_QUERY_CHARS);
        let round = RoundSummary {
            round: 1,
            rationale: String::new(),
            results: vec![QuerySummary::failed(
                query,
                RetrievalFailure::new("q", crate::error::RetrievalFailureKind::Empty, "no hits"),
            )],
        };
        assert!(round.all_failed());
        assert_eq!(round.successful().count(), 0);
    }
}
