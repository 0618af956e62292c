use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{SearchBackend, SearchHit, TextGenerator};
use crate::error::SearchError;
use crate::text::keywords;

/// Document served by [`StaticSearchBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

/// In-memory search backend for tests and offline runs.
///
/// Exact query matches registered with [`StaticSearchBackend::with_results`] or
/// [`StaticSearchBackend::with_failure`] win; otherwise corpus documents are
/// ranked by keyword overlap with the query.
pub struct StaticSearchBackend {
    scripted: DashMap<String, Result<Vec<SearchHit>, SearchError>>,
    corpus: Vec<CorpusDocument>,
    max_results: usize,
}

impl Default for StaticSearchBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticSearchBackend {
    pub fn new() -> Self {
        Self {
            scripted: DashMap::new(),
            corpus: Vec::new(),
            max_results: 5,
        }
    }

    pub fn from_corpus(corpus: Vec<CorpusDocument>) -> Self {
        Self {
            corpus,
            ..Self::new()
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_results(self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.scripted.insert(normalize(query), Ok(hits));
        self
    }

    pub fn with_failure(self, query: &str, error: SearchError) -> Self {
        self.scripted.insert(normalize(query), Err(error));
        self
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    fn rank_corpus(&self, query: &str) -> Vec<SearchHit> {
        let terms: HashSet<String> = keywords(query).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize, &CorpusDocument)> = self
            .corpus
            .iter()
            .enumerate()
            .filter_map(|(idx, doc)| {
                let haystack: HashSet<String> = keywords(&format!("{} {}", doc.title, doc.content))
                    .into_iter()
                    .collect();
                let overlap = terms.intersection(&haystack).count();
                (overlap > 0).then_some((overlap, idx, doc))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(self.max_results)
            .map(|(_, _, doc)| SearchHit {
                url: doc.url.clone(),
                title: doc.title.clone(),
                content: doc.content.clone(),
            })
            .collect()
    }
}

fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

#[async_trait]
impl SearchBackend for StaticSearchBackend {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        if let Some(entry) = self.scripted.get(&normalize(query)) {
            return entry.value().clone();
        }
        Ok(self.rank_corpus(query))
    }
}

/// Text generator replaying canned responses in order.
///
/// Every prompt is recorded so tests can assert on what the orchestrator asked.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<anyhow::Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response at the back of the script.
    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Ok(response.into()));
        }
    }

    /// Queue a backend failure at the back of the script.
    pub fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Err(anyhow!(message)));
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _schema: Option<&serde_json::Value>,
    ) -> anyhow::Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted generator lock poisoned"))?
            .pop_front();
        next.unwrap_or_else(|| Err(anyhow!("scripted generator exhausted")))
    }
}
