//! Capabilities the orchestrator consumes: a search backend and a
//! text-generation backend.

mod http;
mod memory;

pub use http::{HttpSearchBackend, OpenAiCompatibleGenerator};
pub use memory::{CorpusDocument, ScriptedGenerator, StaticSearchBackend};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SearchError;

/// One normalized search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "snippet")]
    pub content: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Ordered results for `query`; an empty vector is a valid answer.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text for `prompt`. When `schema` is given the backend should
    /// constrain its output to JSON matching it; callers validate regardless.
    async fn generate(
        &self,
        prompt: &str,
        schema: Option<&serde_json::Value>,
    ) -> anyhow::Result<String>;
}

pub type DynSearchBackend = Arc<dyn SearchBackend>;
pub type DynTextGenerator = Arc<dyn TextGenerator>;
