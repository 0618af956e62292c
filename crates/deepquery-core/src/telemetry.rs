use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::DeepQueryError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// How the process-wide `tracing` subscriber is set up.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    filter: Option<String>,
    level: String,
    ansi: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            filter: None,
            level: "info".to_string(),
            ansi: std::io::stderr().is_terminal(),
        }
    }
}

impl TelemetryOptions {
    /// Log the DeepQuery crates at `level` (the `[logging]` section); other
    /// crates stay at `warn`.
    pub fn from_level(level: &str) -> Self {
        Self {
            level: level.trim().to_ascii_lowercase(),
            ..Self::default()
        }
    }

    /// Explicit `EnvFilter` directives; win over `RUST_LOG` and the level.
    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    fn resolve_filter(&self, rust_log: Option<String>) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        if let Some(from_env) = rust_log.filter(|value| !value.trim().is_empty()) {
            return from_env;
        }
        level_directives(&self.level)
    }
}

fn level_directives(level: &str) -> String {
    if level.is_empty() {
        return "info".to_string();
    }
    if level.parse::<tracing::Level>().is_ok() {
        format!("warn,deepquery_core={level},deepquery_cli={level}")
    } else {
        // Anything that is not a bare level is taken as a directive list.
        level.to_string()
    }
}

/// Install the stderr fmt subscriber. Later calls are no-ops.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), DeepQueryError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = options.resolve_filter(std::env::var("RUST_LOG").ok());
    let env_filter = EnvFilter::try_new(&filter).map_err(|err| {
        DeepQueryError::InvalidConfiguration(format!("invalid log filter {filter:?}: {err}"))
    })?;

    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_ansi(options.ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| {
            DeepQueryError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_scopes_to_deepquery_crates() {
        let options = TelemetryOptions::from_level(" DEBUG ");
        assert_eq!(
            options.resolve_filter(None),
            "warn,deepquery_core=debug,deepquery_cli=debug"
        );
    }

    #[test]
    fn rust_log_overrides_level_but_not_explicit_filter() {
        let options = TelemetryOptions::from_level("info");
        assert_eq!(options.resolve_filter(Some("trace".into())), "trace");
        assert_eq!(
            options.resolve_filter(Some("  ".into())),
            "warn,deepquery_core=info,deepquery_cli=info"
        );

        let explicit = options.with_filter("deepquery_core::retrieval=trace");
        assert_eq!(
            explicit.resolve_filter(Some("trace".into())),
            "deepquery_core::retrieval=trace"
        );
    }

    #[test]
    fn directive_lists_pass_through() {
        let options = TelemetryOptions::from_level("info,reqwest=debug");
        assert_eq!(options.resolve_filter(None), "info,reqwest=debug");
    }
}
