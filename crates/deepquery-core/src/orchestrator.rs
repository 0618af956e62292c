//! The research driver: plans, retrieves, evaluates and synthesizes in
//! strictly sequential rounds, owning the session state throughout.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backends::{DynSearchBackend, DynTextGenerator};
use crate::citation::CitationRegistry;
use crate::config::{CoverageMode, ResearchConfig};
use crate::coverage::{
    CoverageController, Decision, DynCoverageJudge, GenerativeCoverage, KeywordCoverage, Phase,
    ResearchState, StopReason,
};
use crate::error::{DeepQueryError, PlanningError};
use crate::events::{EventCollector, EventKind, QueryOutcomeStatus};
use crate::metrics;
use crate::model::{FinalAnswer, Query, ResearchTopic, RoundSummary};
use crate::planner::QueryPlanner;
use crate::retrieval::{ExecutorConfig, RetrievalExecutor};
use crate::synthesizer::AnswerSynthesizer;
use crate::trace::TraceCollector;

/// Everything a finished session produced.
#[derive(Debug)]
pub struct ResearchRun {
    pub answer: FinalAnswer,
    pub state: ResearchState,
    pub registry: CitationRegistry,
    pub trace: TraceCollector,
}

pub struct ResearchOrchestrator {
    planner: QueryPlanner,
    executor: RetrievalExecutor,
    controller: CoverageController,
    synthesizer: AnswerSynthesizer,
    events: Option<EventCollector>,
}

impl ResearchOrchestrator {
    pub fn new(
        search: DynSearchBackend,
        generator: DynTextGenerator,
        config: &ResearchConfig,
    ) -> Self {
        let judge: DynCoverageJudge = match config.coverage {
            CoverageMode::Keyword => Arc::new(KeywordCoverage),
            CoverageMode::Generative => Arc::new(GenerativeCoverage::new(generator.clone())),
        };
        Self {
            planner: QueryPlanner::new(generator.clone())
                .with_max_query_chars(config.max_query_chars),
            executor: RetrievalExecutor::new(search, ExecutorConfig::from(config)),
            controller: CoverageController::new(judge),
            synthesizer: AnswerSynthesizer::new(generator),
            events: None,
        }
    }

    pub fn with_judge(mut self, judge: DynCoverageJudge) -> Self {
        self.controller = CoverageController::new(judge);
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one session to completion.
    ///
    /// Every await races `cancel`; a cancelled session returns
    /// [`DeepQueryError::Cancelled`] and drops in-flight searches.
    #[instrument(
        name = "orchestrator.run",
        skip(self, topic, cancel),
        fields(max_rounds = topic.max_rounds(), number_queries = topic.number_queries())
    )]
    pub async fn run(
        &self,
        topic: ResearchTopic,
        cancel: &CancellationToken,
    ) -> Result<ResearchRun, DeepQueryError> {
        let mut state = ResearchState::new(topic);
        let mut registry = CitationRegistry::new();
        let mut trace = TraceCollector::new();

        match self.drive(&mut state, &mut registry, &mut trace, cancel).await {
            Ok(answer) => {
                state.transition(Phase::Done)?;
                Ok(ResearchRun {
                    answer,
                    state,
                    registry,
                    trace,
                })
            }
            Err(err) => {
                state.abort();
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ResearchState,
        registry: &mut CitationRegistry,
        trace: &mut TraceCollector,
        cancel: &CancellationToken,
    ) -> Result<FinalAnswer, DeepQueryError> {
        loop {
            let round = state.begin_round()?;
            self.note(trace, round, EventKind::RoundStarted { round });

            let planned = cancellable(cancel, self.planner.plan(state.planning_context())).await?;
            let plan = match planned {
                Ok(plan) => plan,
                Err(err) if round > 1 => {
                    warn!(round, error = %err, "planning failed; answering from earlier rounds");
                    self.stop_early(state, trace, round, StopReason::PlanningFailed)?;
                    break;
                }
                Err(err) => return Err(err),
            };
            state.apply_plan(&plan);
            self.note(
                trace,
                round,
                EventKind::PlanReady {
                    round,
                    rationale: plan.rationale.clone(),
                    queries: plan.queries.iter().map(|q| q.text().to_string()).collect(),
                },
            );

            if plan.queries.is_empty() {
                if round == 1 {
                    return Err(DeepQueryError::FatalPlanning(PlanningError::Schema(
                        "first plan contains no usable query".into(),
                    )));
                }
                info!(round, "plan repeats earlier searches; moving to synthesis");
                self.stop_early(state, trace, round, StopReason::NothingNewToSearch)?;
                break;
            }

            state.check_budget(plan.queries.len())?;
            state.transition(Phase::Retrieving)?;
            state.record_dispatch(plan.queries.iter().map(Query::text));

            let outcomes = cancellable(cancel, self.executor.dispatch(&plan.queries)).await?;
            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                let duration_ms = outcome.duration_ms;
                let summary = self.executor.summarize(outcome, registry);
                let status = match &summary.failure {
                    None => QueryOutcomeStatus::Success {
                        sources: summary.sources.clone(),
                    },
                    Some(failure) => QueryOutcomeStatus::Failed {
                        kind: failure.kind,
                        reason: failure.reason.clone(),
                    },
                };
                self.note(
                    trace,
                    round,
                    EventKind::QuerySettled {
                        round,
                        query: summary.query.text().to_string(),
                        outcome: status,
                        duration_ms,
                    },
                );
                results.push(summary);
            }

            let summary = RoundSummary {
                round,
                rationale: plan.rationale,
                results,
            };
            let succeeded = summary.successful().count();
            let failed = summary.results.len() - succeeded;
            metrics::record_round(round, succeeded, failed);

            if summary.all_failed() {
                warn!(round, failed, "every query in the round failed");
                return Err(DeepQueryError::RoundFailure {
                    round,
                    failures: summary.failures().cloned().collect(),
                });
            }

            state.record_round(summary)?;
            state.transition(Phase::Evaluating)?;

            let decision = cancellable(cancel, self.controller.evaluate(state)).await??;
            let event = match &decision {
                Decision::Continue { gaps } => EventKind::CoverageDecision {
                    round,
                    continue_search: true,
                    gaps: gaps.clone(),
                    stop_reason: None,
                },
                Decision::Stop { reason } => EventKind::CoverageDecision {
                    round,
                    continue_search: false,
                    gaps: Vec::new(),
                    stop_reason: Some(*reason),
                },
            };
            self.note(trace, round, event);

            if matches!(decision, Decision::Stop { .. }) {
                break;
            }
        }

        let answer = cancellable(
            cancel,
            self.synthesizer.synthesize(
                state.topic(),
                state.response_language(),
                state.rounds(),
                registry,
            ),
        )
        .await?;

        self.note(
            trace,
            state.round(),
            EventKind::AnswerReady {
                citations: answer.citations_used.clone(),
            },
        );
        info!(
            rounds = state.rounds().len(),
            dispatched = state.dispatched(),
            sources = registry.len(),
            citations = answer.citations_used.len(),
            "research session complete"
        );
        Ok(answer)
    }

    /// Leave the planning phase for synthesis without searching this round.
    fn stop_early(
        &self,
        state: &mut ResearchState,
        trace: &mut TraceCollector,
        round: u32,
        reason: StopReason,
    ) -> Result<(), DeepQueryError> {
        state.transition(Phase::Synthesizing)?;
        self.note(
            trace,
            round,
            EventKind::CoverageDecision {
                round,
                continue_search: false,
                gaps: Vec::new(),
                stop_reason: Some(reason),
            },
        );
        Ok(())
    }

    fn note(&self, trace: &mut TraceCollector, round: u32, kind: EventKind) {
        let (step, message) = kind.describe();
        trace.record(step, round, message);
        if let Some(events) = &self.events {
            events.emit(kind);
        }
    }
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, DeepQueryError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeepQueryError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ScriptedGenerator, SearchHit, StaticSearchBackend};
    use crate::error::SearchError;

    fn hit(url: &str, content: &str) -> SearchHit {
        SearchHit {
            url: url.into(),
            title: String::new(),
            content: content.into(),
        }
    }

    fn plan(queries: &[&str]) -> String {
        serde_json::json!({
            "rationale": "cover the topic",
            "query": queries,
            "response_language": "English"
        })
        .to_string()
    }

    #[tokio::test]
    async fn all_failed_round_is_a_round_failure() {
        let search = StaticSearchBackend::new()
            .with_failure("a", SearchError::Backend("down".into()))
            .with_failure("b", SearchError::Backend("down".into()));
        let generator = ScriptedGenerator::new([plan(&["a", "b"])]);
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(search),
            Arc::new(generator),
            &ResearchConfig::default(),
        );

        let topic = ResearchTopic::new("anything", 2, 2).unwrap();
        let err = orchestrator
            .run(topic, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeepQueryError::RoundFailure { round: 1, ref failures } if failures.len() == 2));
        assert!(err.is_user_visible());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_planning() {
        let generator = Arc::new(ScriptedGenerator::new([plan(&["a"])]));
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(StaticSearchBackend::new()),
            generator.clone(),
            &ResearchConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let topic = ResearchTopic::new("anything", 1, 1).unwrap();
        let err = orchestrator.run(topic, &cancel).await.unwrap_err();
        assert!(matches!(err, DeepQueryError::Cancelled));
        assert_eq!(generator.remaining(), 1);
    }

    #[tokio::test]
    async fn later_planning_failure_answers_from_earlier_rounds() {
        let search = StaticSearchBackend::new().with_results(
            "apple revenue 2023",
            vec![hit("https://www.apple.com/newsroom/q4", "Revenue fell 3 percent.")],
        );
        let generator = ScriptedGenerator::new([
            plan(&["apple revenue 2023"]),
            "garbage".to_string(),
            "still garbage".to_string(),
            "```\nRevenue fell [apple].\n```".to_string(),
        ]);
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(search),
            Arc::new(generator),
            &ResearchConfig::default(),
        );

        let topic = ResearchTopic::new("Apple revenue vs iPhone units", 1, 2).unwrap();
        let run = orchestrator
            .run(topic, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.state.rounds().len(), 1);
        assert_eq!(run.answer.citations_used, vec!["apple"]);
        assert_eq!(run.state.phase(), Phase::Done);
        assert!(
            run.trace
                .events()
                .iter()
                .any(|event| event.message.contains("PlanningFailed"))
        );
    }

    #[tokio::test]
    async fn first_round_planning_failure_is_fatal() {
        let generator = ScriptedGenerator::new(["garbage", "still garbage"]);
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(StaticSearchBackend::new()),
            Arc::new(generator),
            &ResearchConfig::default(),
        );

        let topic = ResearchTopic::new("anything", 1, 2).unwrap();
        let err = orchestrator
            .run(topic, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeepQueryError::FatalPlanning(_)));
    }

    #[tokio::test]
    async fn repeated_plan_goes_straight_to_synthesis() {
        let search = StaticSearchBackend::new().with_results(
            "lithium prices",
            vec![hit("https://www.reuters.com/a", "Spodumene concentrate fell sharply.")],
        );
        let generator = ScriptedGenerator::new([
            plan(&["lithium prices"]),
            plan(&["Lithium prices"]),
            "```\nSpodumene fell [reuters].\n```".to_string(),
        ]);
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(search),
            Arc::new(generator),
            &ResearchConfig::default(),
        );

        let topic = ResearchTopic::new("lithium prices", 1, 3).unwrap();
        let run = orchestrator
            .run(topic, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.state.rounds().len(), 1);
        assert_eq!(run.state.dispatched(), 1);
        assert_eq!(run.answer.citations_used, vec!["reuters"]);
        assert_eq!(run.state.phase(), Phase::Done);
        assert!(
            run.trace
                .events()
                .iter()
                .any(|event| event.message.contains("NothingNewToSearch"))
        );
    }
}
