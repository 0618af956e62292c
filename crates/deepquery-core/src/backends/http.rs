use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{SearchBackend, SearchHit, TextGenerator};
use crate::config::Config;
use crate::error::SearchError;
use crate::{DeepQueryError, SecretValue};

const USER_AGENT: &str = concat!("deepquery/", env!("CARGO_PKG_VERSION"));
const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_SNIPPET_CHARS: usize = 200;

/// Text generation over any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiCompatibleGenerator {
    http: Client,
    base_url: String,
    model: String,
    api_key: SecretValue,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatibleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleGenerator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key)
            .finish()
    }
}

impl OpenAiCompatibleGenerator {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretValue,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from the `[llm]` section; the key is read from the environment.
    pub fn from_config(http: Client, config: &Config) -> Result<Self, DeepQueryError> {
        let api_key = config.llm_api_key()?;
        Ok(Self::new(http, &config.llm.base_url, &config.llm.model, api_key)
            .with_timeout(Duration::from_millis(config.llm.timeout_ms)))
    }

    fn request_body(&self, prompt: &str, schema: Option<&Value>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "schema": schema,
                },
            });
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn generate(&self, prompt: &str, schema: Option<&Value>) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&self.request_body(prompt, schema))
            .timeout(self.timeout)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, "chat completion returned an error status");
            return Err(anyhow!("HTTP {status}: {}", snippet(&text)));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .context("chat completion body is not valid JSON")?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completion contained no message content"))?;

        debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content)
    }
}

/// Search over an HTTP endpoint accepting `{"query", "max_results"}` and
/// answering `{"results": [{"url", "title", "content"}]}`.
#[derive(Clone)]
pub struct HttpSearchBackend {
    http: Client,
    endpoint: String,
    api_key: Option<SecretValue>,
    max_results: usize,
}

impl std::fmt::Debug for HttpSearchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSearchBackend")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key)
            .field("max_results", &self.max_results)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl HttpSearchBackend {
    pub fn new(http: Client, endpoint: impl Into<String>, api_key: Option<SecretValue>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            max_results: 5,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Build from the `[search]` section.
    pub fn from_config(http: Client, config: &Config) -> Result<Self, DeepQueryError> {
        let api_key = config.search_api_key()?;
        Ok(Self::new(http, &config.search.endpoint, api_key)
            .with_max_results(config.search.max_results))
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&json!({ "query": query, "max_results": self.max_results }))
            .timeout(SEARCH_REQUEST_TIMEOUT);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                SearchError::Transient(err.to_string())
            } else {
                SearchError::Backend(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", snippet(&text));
            warn!(status = %status, "search backend returned an error status");
            return Err(if is_transient_status(status) {
                SearchError::Transient(message)
            } else {
                SearchError::Backend(message)
            });
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|err| SearchError::Backend(format!("malformed search response: {err}")))?;
        Ok(body.results.into_iter().take(self.max_results).collect())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn snippet(text: &str) -> String {
    crate::model::truncate_chars(text.trim(), ERROR_SNIPPET_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn status_classification() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn debug_output_redacts_key() {
        let generator = OpenAiCompatibleGenerator::new(
            Client::new(),
            "https://api.example.com/v1/",
            "gpt-test",
            SecretValue::from("sk-live"),
        );
        let rendered = format!("{generator:?}");
        assert!(!rendered.contains("sk-live"));
        assert!(rendered.contains("https://api.example.com/v1\""));
    }

    #[tokio::test]
    async fn generator_sends_schema_and_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "gpt-test",
                "response_format": { "type": "json_schema" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "{\"query\": [\"a\"]}" } }]
            })))
            .mount(&server)
            .await;

        let generator = OpenAiCompatibleGenerator::new(
            Client::new(),
            server.uri(),
            "gpt-test",
            SecretValue::from("test-key"),
        );
        let schema = json!({ "type": "object" });
        let output = generator.generate("plan", Some(&schema)).await.unwrap();
        assert_eq!(output, "{\"query\": [\"a\"]}");
    }

    #[tokio::test]
    async fn generator_surfaces_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let generator = OpenAiCompatibleGenerator::new(
            Client::new(),
            server.uri(),
            "gpt-test",
            SecretValue::from("wrong"),
        );
        let err = generator.generate("plan", None).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn search_parses_results_and_caps_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({ "query": "rust async" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    { "url": "https://tokio.rs", "title": "Tokio", "content": "Runtime." },
                    { "url": "https://docs.rs/futures", "snippet": "Futures." },
                    { "url": "https://example.com/3", "content": "Third." }
                ]
            })))
            .mount(&server)
            .await;

        let backend = HttpSearchBackend::new(Client::new(), format!("{}/search", server.uri()), None)
            .with_max_results(2);
        let hits = backend.search("rust async").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].content, "Futures.");
    }

    #[tokio::test]
    async fn search_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let backend = HttpSearchBackend::new(
            Client::new(),
            server.uri(),
            Some(SecretValue::from("key")),
        );
        let err = backend.search("anything").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn search_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .mount(&server)
            .await;

        let backend = HttpSearchBackend::new(Client::new(), server.uri(), None);
        let err = backend.search("anything").await.unwrap_err();
        assert!(matches!(err, SearchError::Backend(message) if message.contains("bad query")));
    }
}
