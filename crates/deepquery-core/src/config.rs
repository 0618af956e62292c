use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::security::optional_env;
use crate::{DeepQueryError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "DEEPQUERY_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, DeepQueryError> {
        require_env(&self.llm.api_key_env)
    }

    /// Resolve the search backend secret, if one is configured.
    pub fn search_api_key(&self) -> Result<Option<SecretValue>, DeepQueryError> {
        optional_env(self.search.api_key_env.as_deref())
    }
}

/// Loads configuration from disk and validates it.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPQUERY_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, DeepQueryError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DeepQueryError::config_io(candidate.clone(), err))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Config, DeepQueryError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| DeepQueryError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), DeepQueryError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(DeepQueryError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.search.endpoint.trim().is_empty() {
            return Err(DeepQueryError::InvalidConfiguration(
                "search.endpoint must not be empty".into(),
            ));
        }

        let research = &config.research;
        if research.number_queries == 0 || research.max_rounds == 0 {
            return Err(DeepQueryError::InvalidConfiguration(
                "research.number_queries and research.max_rounds must be at least 1".into(),
            ));
        }
        if research.max_concurrent_queries == 0 {
            return Err(DeepQueryError::InvalidConfiguration(
                "research.max_concurrent_queries must be at least 1".into(),
            ));
        }
        if research.max_query_chars < 16 {
            return Err(DeepQueryError::InvalidConfiguration(
                "research.max_query_chars must be at least 16".into(),
            ));
        }

        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    fn default_provider() -> String {
        "openai".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    const fn default_timeout_ms() -> u64 {
        60_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "SearchConfig::default_max_results")]
    pub max_results: usize,
}

impl SearchConfig {
    const fn default_max_results() -> usize {
        5
    }
}

/// Which coverage judge drives the continue/stop decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    #[default]
    Keyword,
    Generative,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "ResearchConfig::default_number_queries")]
    pub number_queries: usize,
    #[serde(default = "ResearchConfig::default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "ResearchConfig::default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "ResearchConfig::default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
    #[serde(default = "ResearchConfig::default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "ResearchConfig::default_max_results_per_query")]
    pub max_results_per_query: usize,
    #[serde(default)]
    pub coverage: CoverageMode,
}

impl ResearchConfig {
    const fn default_number_queries() -> usize {
        3
    }

    const fn default_max_rounds() -> u32 {
        2
    }

    const fn default_query_timeout_ms() -> u64 {
        20_000
    }

    const fn default_max_concurrent_queries() -> usize {
        5
    }

    const fn default_max_query_chars() -> usize {
        300
    }

    const fn default_max_results_per_query() -> usize {
        5
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            number_queries: Self::default_number_queries(),
            max_rounds: Self::default_max_rounds(),
            query_timeout_ms: Self::default_query_timeout_ms(),
            max_concurrent_queries: Self::default_max_concurrent_queries(),
            max_query_chars: Self::default_max_query_chars(),
            max_results_per_query: Self::default_max_results_per_query(),
            coverage: CoverageMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [llm]
        model = "gpt-4o-mini"
        api_key_env = "OPENAI_API_KEY"

        [search]
        endpoint = "https://search.example.com/v1/search"
    "#;

    #[test]
    fn research_defaults_apply_when_section_missing() {
        let config = ConfigLoader::from_toml(MINIMAL).expect("config should parse");
        assert_eq!(config.research.number_queries, 3);
        assert_eq!(config.research.max_rounds, 2);
        assert_eq!(config.research.max_query_chars, 300);
        assert_eq!(config.research.coverage, CoverageMode::Keyword);
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let raw = format!("{MINIMAL}\n[research]\nmax_rounds = 0\n");
        let err = ConfigLoader::from_toml(&raw).unwrap_err();
        assert!(matches!(err, DeepQueryError::InvalidConfiguration(_)));
    }

    #[test]
    fn coverage_mode_parses_generative() {
        let raw = format!("{MINIMAL}\n[research]\ncoverage = \"generative\"\n");
        let config = ConfigLoader::from_toml(&raw).expect("config should parse");
        assert_eq!(config.research.coverage, CoverageMode::Generative);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/deepquery.toml")))
            .unwrap_err();
        match err {
            DeepQueryError::ConfigIo { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/deepquery.toml"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
