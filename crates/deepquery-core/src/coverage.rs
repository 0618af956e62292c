//! Session state machine and the stop/continue decision taken after each
//! retrieval round.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::backends::DynTextGenerator;
use crate::error::DeepQueryError;
use crate::model::{ResearchTopic, RoundSummary};
use crate::planner::{PlanningContext, QueryPlan};
use crate::text::{extract_json_object, keywords, leading_sentences, tokens};

const EVIDENCE_PREVIEW_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Retrieving,
    Evaluating,
    Synthesizing,
    Done,
}

impl Phase {
    /// Legal forward transitions. `Planning -> Synthesizing` covers a later
    /// round whose plan has nothing new to search.
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Planning, Phase::Retrieving)
                | (Phase::Planning, Phase::Synthesizing)
                | (Phase::Retrieving, Phase::Evaluating)
                | (Phase::Evaluating, Phase::Planning)
                | (Phase::Evaluating, Phase::Synthesizing)
                | (Phase::Synthesizing, Phase::Done)
        )
    }
}

/// Mutable state of one research session, owned by the driving loop.
#[derive(Debug, Clone)]
pub struct ResearchState {
    topic: ResearchTopic,
    round: u32,
    phase: Phase,
    rounds: Vec<RoundSummary>,
    labels_used: Vec<String>,
    issued_queries: Vec<String>,
    aspects: Vec<String>,
    gaps: Vec<String>,
    dispatched: usize,
    response_language: Option<String>,
    terminal: bool,
}

impl ResearchState {
    pub fn new(topic: ResearchTopic) -> Self {
        let response_language = topic.response_language().map(str::to_string);
        Self {
            topic,
            round: 0,
            phase: Phase::Planning,
            rounds: Vec::new(),
            labels_used: Vec::new(),
            issued_queries: Vec::new(),
            aspects: Vec::new(),
            gaps: Vec::new(),
            dispatched: 0,
            response_language,
            terminal: false,
        }
    }

    pub fn topic(&self) -> &ResearchTopic {
        &self.topic
    }

    /// Round currently being planned or executed; zero before the first round.
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rounds(&self) -> &[RoundSummary] {
        &self.rounds
    }

    /// Distinct labels cited by successful summaries, in first-seen order.
    pub fn labels_used(&self) -> &[String] {
        &self.labels_used
    }

    pub fn issued_queries(&self) -> &[String] {
        &self.issued_queries
    }

    pub fn aspects(&self) -> &[String] {
        &self.aspects
    }

    pub fn gaps(&self) -> &[String] {
        &self.gaps
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn response_language(&self) -> Option<&str> {
        self.response_language.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn transition(&mut self, next: Phase) -> Result<(), DeepQueryError> {
        if self.terminal || !self.phase.can_transition_to(next) {
            return Err(DeepQueryError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = ?self.phase, to = ?next, round = self.round, "phase transition");
        self.phase = next;
        if next == Phase::Done {
            self.terminal = true;
        }
        Ok(())
    }

    /// End the session without an answer.
    pub fn abort(&mut self) {
        self.phase = Phase::Done;
        self.terminal = true;
    }

    /// Open the next round; only legal while planning.
    pub fn begin_round(&mut self) -> Result<u32, DeepQueryError> {
        if self.phase != Phase::Planning || self.terminal {
            return Err(DeepQueryError::InvalidTransition {
                from: self.phase,
                to: Phase::Planning,
            });
        }
        if self.round >= self.topic.max_rounds() {
            return Err(DeepQueryError::BudgetExceeded {
                attempted: self.round as usize + 1,
                ceiling: self.topic.max_rounds() as usize,
            });
        }
        self.round += 1;
        Ok(self.round)
    }

    /// Snapshot handed to the planner for the current round.
    pub fn planning_context(&self) -> PlanningContext<'_> {
        PlanningContext {
            topic: &self.topic,
            round: self.round,
            previous_rounds: &self.rounds,
            gaps: &self.gaps,
            issued: &self.issued_queries,
        }
    }

    /// Adopt the aspects and language of an accepted plan. Aspects are fixed
    /// by the first plan that names any; an explicit topic language wins.
    pub fn apply_plan(&mut self, plan: &QueryPlan) {
        if self.aspects.is_empty() && !plan.aspects.is_empty() {
            self.aspects = plan.aspects.clone();
        }
        if self.response_language.is_none() {
            self.response_language = plan.response_language.clone();
        }
    }

    /// Fail with `BudgetExceeded` if dispatching `additional` more queries
    /// would cross the session's N×K ceiling or the per-round budget.
    pub fn check_budget(&self, additional: usize) -> Result<(), DeepQueryError> {
        let ceiling = self.topic.dispatch_ceiling();
        let attempted = self.dispatched.saturating_add(additional);
        if additional > self.topic.number_queries() || attempted > ceiling {
            return Err(DeepQueryError::BudgetExceeded { attempted, ceiling });
        }
        Ok(())
    }

    pub fn record_dispatch<'a>(&mut self, queries: impl IntoIterator<Item = &'a str>) {
        for query in queries {
            self.dispatched += 1;
            self.issued_queries.push(query.to_string());
        }
    }

    /// Append a finished round. Rounds must arrive in order, carry the
    /// current round number, and only contain queries issued in that round.
    pub fn record_round(&mut self, summary: RoundSummary) -> Result<(), DeepQueryError> {
        let expected = self.rounds.len() as u32 + 1;
        if summary.round != expected || summary.round != self.round {
            return Err(DeepQueryError::Other(anyhow::anyhow!(
                "round {} recorded out of order (expected {expected})",
                summary.round
            )));
        }
        if let Some(stray) = summary
            .results
            .iter()
            .find(|result| result.query.round() != summary.round)
        {
            return Err(DeepQueryError::Other(anyhow::anyhow!(
                "query \"{}\" from round {} recorded in round {}",
                stray.query.text(),
                stray.query.round(),
                summary.round
            )));
        }

        for label in summary.successful().flat_map(|result| result.sources.iter()) {
            if !self.labels_used.contains(label) {
                self.labels_used.push(label.clone());
            }
        }
        self.rounds.push(summary);
        Ok(())
    }

    fn set_gaps(&mut self, gaps: Vec<String>) {
        self.gaps = gaps;
    }
}

/// What the judge made of the evidence gathered so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    /// Aspects or follow-up questions that still lack evidence; empty when
    /// coverage is sufficient.
    pub gaps: Vec<String>,
}

impl Assessment {
    pub fn sufficient() -> Self {
        Self::default()
    }

    pub fn is_sufficient(&self) -> bool {
        self.gaps.is_empty()
    }
}

#[async_trait]
pub trait CoverageJudge: Send + Sync {
    async fn assess(
        &self,
        topic: &ResearchTopic,
        aspects: &[String],
        rounds: &[RoundSummary],
    ) -> Assessment;
}

/// Deterministic judge: an aspect is covered when at least half of its
/// keywords occur in the successful summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordCoverage;

impl KeywordCoverage {
    pub fn uncovered(
        &self,
        topic: &ResearchTopic,
        aspects: &[String],
        rounds: &[RoundSummary],
    ) -> Vec<String> {
        let evidence: HashSet<String> = rounds
            .iter()
            .flat_map(|round| round.successful())
            .flat_map(|result| tokens(&result.content))
            .collect();

        let fallback = [topic.question().to_string()];
        let aspects = if aspects.is_empty() { &fallback[..] } else { aspects };

        aspects
            .iter()
            .filter(|aspect| {
                let wanted = keywords(aspect);
                if wanted.is_empty() {
                    return false;
                }
                let present = wanted
                    .iter()
                    .filter(|word| mentions(&evidence, word))
                    .count();
                present * 2 < wanted.len()
            })
            .cloned()
            .collect()
    }
}

fn mentions(evidence: &HashSet<String>, word: &str) -> bool {
    evidence.contains(word)
        || evidence.contains(&format!("{word}s"))
        || word
            .strip_suffix('s')
            .is_some_and(|stem| stem.len() >= 3 && evidence.contains(stem))
}

#[async_trait]
impl CoverageJudge for KeywordCoverage {
    async fn assess(
        &self,
        topic: &ResearchTopic,
        aspects: &[String],
        rounds: &[RoundSummary],
    ) -> Assessment {
        Assessment {
            gaps: self.uncovered(topic, aspects, rounds),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reflection {
    is_sufficient: bool,
    #[serde(default)]
    knowledge_gap: String,
    #[serde(default)]
    follow_up_queries: Vec<String>,
}

/// Judge that asks the text generator whether the evidence answers the topic.
/// Unusable answers fall back to [`KeywordCoverage`].
pub struct GenerativeCoverage {
    generator: DynTextGenerator,
    fallback: KeywordCoverage,
}

impl GenerativeCoverage {
    pub fn new(generator: DynTextGenerator) -> Self {
        Self {
            generator,
            fallback: KeywordCoverage,
        }
    }

    pub fn response_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "is_sufficient": { "type": "boolean" },
                "knowledge_gap": { "type": "string" },
                "follow_up_queries": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["is_sufficient", "knowledge_gap", "follow_up_queries"]
        })
    }

    fn build_prompt(
        &self,
        topic: &ResearchTopic,
        aspects: &[String],
        rounds: &[RoundSummary],
    ) -> String {
        let mut prompt = format!(
            "You review research notes and decide whether they answer the topic.\n\n\
             Research topic: {}\n",
            topic.question()
        );
        if !aspects.is_empty() {
            prompt.push_str("\nAspects the answer must cover:\n");
            for aspect in aspects {
                let _ = writeln!(prompt, "- {aspect}");
            }
        }
        prompt.push_str("\nNotes:\n");
        for result in rounds.iter().flat_map(|round| round.successful()) {
            let _ = writeln!(
                prompt,
                "- ({}) {}",
                result.query.text(),
                leading_sentences(&result.content, EVIDENCE_PREVIEW_CHARS)
            );
        }
        prompt.push_str(
            "\nIf the notes are not enough, describe the missing knowledge and propose \
             self-contained follow-up search queries. Respond with a JSON object: \
             {\"is_sufficient\": bool, \"knowledge_gap\": string, \"follow_up_queries\": [string]}.",
        );
        prompt
    }
}

#[async_trait]
impl CoverageJudge for GenerativeCoverage {
    async fn assess(
        &self,
        topic: &ResearchTopic,
        aspects: &[String],
        rounds: &[RoundSummary],
    ) -> Assessment {
        let prompt = self.build_prompt(topic, aspects, rounds);
        let schema = Self::response_schema();
        let reflection = match self.generator.generate(&prompt, Some(&schema)).await {
            Ok(raw) => extract_json_object(&raw)
                .and_then(|json| serde_json::from_str::<Reflection>(json).ok()),
            Err(err) => {
                warn!(error = %err, "coverage generation failed");
                None
            }
        };

        let Some(reflection) = reflection else {
            warn!("coverage judgment unusable; falling back to keyword coverage");
            return self.fallback.assess(topic, aspects, rounds).await;
        };

        if reflection.is_sufficient {
            return Assessment::sufficient();
        }

        let mut gaps: Vec<String> = reflection
            .follow_up_queries
            .into_iter()
            .map(|query| query.trim().to_string())
            .filter(|query| !query.is_empty())
            .collect();
        if gaps.is_empty() {
            let gap = reflection.knowledge_gap.trim();
            gaps.push(if gap.is_empty() {
                topic.question().to_string()
            } else {
                gap.to_string()
            });
        }
        Assessment { gaps }
    }
}

/// Why the loop stopped searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Covered,
    RoundBudgetExhausted,
    NothingNewToSearch,
    /// A later round could not be planned; earlier rounds still answer.
    PlanningFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue { gaps: Vec<String> },
    Stop { reason: StopReason },
}

pub type DynCoverageJudge = Arc<dyn CoverageJudge>;

pub struct CoverageController {
    judge: DynCoverageJudge,
}

impl Default for CoverageController {
    fn default() -> Self {
        Self::new(Arc::new(KeywordCoverage))
    }
}

impl CoverageController {
    pub fn new(judge: DynCoverageJudge) -> Self {
        Self { judge }
    }

    /// Decide whether to plan another round and move the state accordingly.
    #[instrument(name = "coverage.evaluate", skip(self, state), fields(round = state.round()))]
    pub async fn evaluate(&self, state: &mut ResearchState) -> Result<Decision, DeepQueryError> {
        if state.phase() != Phase::Evaluating {
            return Err(DeepQueryError::InvalidTransition {
                from: state.phase(),
                to: Phase::Evaluating,
            });
        }

        let decision = if state.round() >= state.topic().max_rounds() {
            Decision::Stop {
                reason: StopReason::RoundBudgetExhausted,
            }
        } else {
            let assessment = self
                .judge
                .assess(state.topic(), state.aspects(), state.rounds())
                .await;
            if assessment.is_sufficient() {
                Decision::Stop {
                    reason: StopReason::Covered,
                }
            } else {
                Decision::Continue {
                    gaps: assessment.gaps,
                }
            }
        };

        match &decision {
            Decision::Continue { gaps } => {
                info!(gaps = gaps.len(), "coverage incomplete; planning another round");
                state.set_gaps(gaps.clone());
                state.transition(Phase::Planning)?;
            }
            Decision::Stop { reason } => {
                info!(reason = ?reason, "coverage evaluation stopped the search");
                state.set_gaps(Vec::new());
                state.transition(Phase::Synthesizing)?;
            }
        }
        Ok(decision)
    }
}
