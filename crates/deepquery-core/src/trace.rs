use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// One step of a session's reasoning trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: String,
    pub message: String,
    pub round: u32,
    pub timestamp_ms: u128,
}

impl TraceEvent {
    pub fn new(step: impl Into<String>, round: u32, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            step: step.into(),
            message: message.into(),
            round,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: impl Into<String>, round: u32, message: impl Into<String>) {
        self.events.push(TraceEvent::new(step, round, message));
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub round: u32,
    pub step: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                round: event.round,
                step: event.step.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    /// Numbered list grouped under one heading per round.
    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Research Trace\n");
        let mut current_round = None;
        for step in &self.steps {
            if current_round != Some(step.round) {
                current_round = Some(step.round);
                if step.round == 0 {
                    output.push_str("\n#### Session\n");
                } else {
                    let _ = writeln!(output, "\n#### Round {}", step.round);
                }
            }
            let _ = writeln!(output, "{}. **{}**: {}", step.index, step.step, step.message);
        }
        output
    }

    /// Flowchart with one subgraph per round.
    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        let mut open_round: Option<u32> = None;
        for step in &self.steps {
            if open_round != Some(step.round) {
                if open_round.is_some() {
                    output.push_str("  end\n");
                }
                let _ = writeln!(output, "  subgraph round{}[\"Round {}\"]", step.round, step.round);
                open_round = Some(step.round);
            }
            let label = sanitize_mermaid(&format!("{}: {}", step.step, step.message));
            let _ = writeln!(output, "    step{}[\"{label}\"]", step.index);
        }
        output.push_str("  end\n");

        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} --> step{}", pair[0].index, pair[1].index);
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "#quot;")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Session ids double as file names: ASCII alphanumerics, `-`, `_` and
/// inner dots only.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && !session_id.contains("..")
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Write the trace of `session_id` to `<dir>/<session_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    session_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    if !is_valid_session_id(session_id) {
        bail!("session id {session_id:?} is not usable as a file name");
    }
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{session_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collector() -> TraceCollector {
        let mut collector = TraceCollector::new();
        collector.record("planner", 1, "2 queries: apple revenue | iphone units");
        collector.record("retrieval", 1, "\"apple revenue\" -> [apple]");
        collector.record("coverage", 1, "continue; gaps: iphone units");
        collector.record("planner", 2, "1 query: iphone unit sales");
        collector
    }

    #[test]
    fn markdown_groups_steps_by_round() {
        let markdown = collector().summary().render_markdown();
        assert!(markdown.contains("#### Round 1"));
        assert!(markdown.contains("#### Round 2"));
        assert!(markdown.contains("4. **planner**"));
    }

    #[test]
    fn mermaid_escapes_brackets_and_links_steps() {
        let mermaid = collector().summary().render_mermaid();
        assert!(mermaid.starts_with("flowchart TD"));
        assert!(mermaid.contains("subgraph round2"));
        assert!(mermaid.contains("step3 --> step4"));
        assert!(mermaid.contains("(apple)"));
        assert!(!mermaid.contains("[apple]"));
    }

    #[test]
    fn persisted_trace_round_trips() {
        let temp = TempDir::new().expect("temp dir");
        let collector = collector();
        let path = persist_trace(temp.path(), "session-1", collector.events()).unwrap();
        assert!(path.ends_with("session-1.json"));

        let loaded: Vec<TraceEvent> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[3].round, 2);
    }

    #[test]
    fn session_ids_cannot_escape_the_trace_dir() {
        let temp = TempDir::new().expect("temp dir");
        let events = collector().events().to_vec();
        for id in ["../x", "a/b", "a\\b", "..", ".hidden", ""] {
            assert!(persist_trace(temp.path(), id, &events).is_err(), "{id}");
        }
        assert!(is_valid_session_id("session-2f1c.v2"));
    }
}
