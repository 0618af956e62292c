//! Retrieval fan-out: one search task per query, bounded by a semaphore and a
//! per-query timeout.
//!
//! Tasks only return raw outcomes. Registering sources and building the
//! per-query summaries happens afterwards on the driver, which owns the
//! citation registry.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backends::{DynSearchBackend, SearchBackend, SearchHit};
use crate::citation::CitationRegistry;
use crate::error::{RetrievalFailure, RetrievalFailureKind, SearchError};
use crate::metrics;
use crate::model::{Query, QuerySummary};
use crate::text::{escape_brackets, leading_sentences};

/// Configuration for executor behaviour.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout for a single query dispatch, retries included.
    pub query_timeout: Duration,
    /// Maximum concurrent dispatches.
    pub max_concurrent_queries: usize,
    /// Maximum retry attempts for transient backend failures.
    pub max_retries: usize,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Hits kept per query when summarizing.
    pub max_results_per_query: usize,
    /// Character budget for each hit's extract.
    pub extract_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(20_000),
            max_concurrent_queries: 5,
            max_retries: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            max_results_per_query: 5,
            extract_chars: 320,
        }
    }
}

impl From<&crate::config::ResearchConfig> for ExecutorConfig {
    fn from(config: &crate::config::ResearchConfig) -> Self {
        Self {
            query_timeout: Duration::from_millis(config.query_timeout_ms),
            max_concurrent_queries: config.max_concurrent_queries.max(1),
            max_results_per_query: config.max_results_per_query.max(1),
            ..Self::default()
        }
    }
}

/// Raw result of one dispatch, tagged with the query's position in the round.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub index: usize,
    pub query: Query,
    pub result: Result<Vec<SearchHit>, RetrievalFailure>,
    pub duration_ms: u64,
}

pub struct RetrievalExecutor {
    backend: DynSearchBackend,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
}

impl RetrievalExecutor {
    pub fn new(backend: DynSearchBackend, config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_queries.max(1)));
        Self {
            backend,
            config,
            semaphore,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Dispatch every query concurrently and wait until all have settled.
    ///
    /// Outcomes come back in query order. Dropping the returned future aborts
    /// all in-flight dispatches.
    #[instrument(name = "executor.dispatch", skip(self, queries), fields(queries = queries.len()))]
    pub async fn dispatch(&self, queries: &[Query]) -> Vec<QueryOutcome> {
        let mut join_set = JoinSet::new();

        for (index, query) in queries.iter().cloned().enumerate() {
            let backend = self.backend.clone();
            let semaphore = self.semaphore.clone();
            let config = self.config.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let result = run_query(backend.as_ref(), &query, &config).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let status = match &result {
                    Ok(_) => "success",
                    Err(failure) => match failure.kind {
                        RetrievalFailureKind::Timeout => "timeout",
                        RetrievalFailureKind::Empty => "empty",
                        RetrievalFailureKind::Backend => "error",
                    },
                };
                metrics::record_dispatch(status, duration_ms);

                QueryOutcome {
                    index,
                    query,
                    result,
                    duration_ms,
                }
            });
        }

        let mut slots: Vec<Option<QueryOutcome>> = vec![None; queries.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    let index = outcome.index;
                    slots[index] = Some(outcome);
                }
                Err(err) => warn!(error = %err, "retrieval task did not complete"),
            }
        }

        slots
            .into_iter()
            .zip(queries)
            .enumerate()
            .map(|(index, (slot, query))| {
                slot.unwrap_or_else(|| QueryOutcome {
                    index,
                    query: query.clone(),
                    result: Err(RetrievalFailure::new(
                        query.text(),
                        RetrievalFailureKind::Backend,
                        "retrieval task aborted",
                    )),
                    duration_ms: 0,
                })
            })
            .collect()
    }

    /// Normalize one outcome into a summary, registering its sources.
    pub fn summarize(&self, outcome: QueryOutcome, registry: &mut CitationRegistry) -> QuerySummary {
        let hits = match outcome.result {
            Ok(hits) => hits,
            Err(failure) => return QuerySummary::failed(outcome.query, failure),
        };

        let mut seen_urls = HashSet::new();
        let mut sources = Vec::new();
        let mut content = String::new();

        for hit in hits
            .iter()
            .filter(|hit| !hit.url.trim().is_empty())
            .filter(|hit| seen_urls.insert(hit.url.trim().to_string()))
            .take(self.config.max_results_per_query)
        {
            let label = registry.register_source(&hit.url, &hit.title, &hit.content);
            let extract =
                escape_brackets(&leading_sentences(&hit.content, self.config.extract_chars));
            let title = escape_brackets(hit.title.trim());

            let _ = match (title.is_empty(), extract.is_empty()) {
                (false, false) => writeln!(content, "- **{title}**: {extract} [{label}]"),
                (false, true) => writeln!(content, "- **{title}** [{label}]"),
                (true, false) => writeln!(content, "- {extract} [{label}]"),
                (true, true) => writeln!(content, "- {} [{label}]", hit.url.trim()),
            };
            if !sources.contains(&label) {
                sources.push(label);
            }
        }

        if sources.is_empty() {
            let failure = RetrievalFailure::new(
                outcome.query.text(),
                RetrievalFailureKind::Empty,
                "no results with a usable URL",
            );
            return QuerySummary::failed(outcome.query, failure);
        }

        debug!(
            query = %outcome.query.text(),
            sources = sources.len(),
            "summarized query results"
        );

        QuerySummary {
            query: outcome.query,
            sources,
            content: content.trim_end().to_string(),
            failure: None,
        }
    }
}

async fn run_query(
    backend: &dyn SearchBackend,
    query: &Query,
    config: &ExecutorConfig,
) -> Result<Vec<SearchHit>, RetrievalFailure> {
    match tokio::time::timeout(config.query_timeout, search_with_retry(backend, query, config))
        .await
    {
        Ok(Ok(hits)) if hits.is_empty() => Err(RetrievalFailure::new(
            query.text(),
            RetrievalFailureKind::Empty,
            "search returned no results",
        )),
        Ok(Ok(hits)) => Ok(hits),
        Ok(Err(err)) => Err(RetrievalFailure::new(
            query.text(),
            RetrievalFailureKind::Backend,
            err.to_string(),
        )),
        Err(_) => Err(RetrievalFailure::new(
            query.text(),
            RetrievalFailureKind::Timeout,
            format!("no response within {} ms", config.query_timeout.as_millis()),
        )),
    }
}

async fn search_with_retry(
    backend: &dyn SearchBackend,
    query: &Query,
    config: &ExecutorConfig,
) -> Result<Vec<SearchHit>, SearchError> {
    let mut attempt = 0;
    let mut backoff_ms = config.initial_backoff_ms;

    loop {
        match backend.search(query.text()).await {
            Ok(hits) => {
                info!(query = %query.text(), hits = hits.len(), "search completed");
                return Ok(hits);
            }
            Err(err) if attempt < config.max_retries && err.is_retryable() => {
                attempt += 1;
                warn!(
                    query = %query.text(),
                    error = %err,
                    attempt,
                    backoff_ms,
                    "search failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(config.max_backoff_ms);
            }
            Err(err) => {
                warn!(query = %query.text(), error = %err, "search failed permanently");
                return Err(err);
            }
        }
    }
}
