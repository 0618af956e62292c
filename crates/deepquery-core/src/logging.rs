//! Session completion log: one JSON line per finished session, with secrets
//! redacted and old months pruned.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

const LOG_DIR_ENV: &str = "DEEPQUERY_LOG_DIR";
const RETENTION_ENV: &str = "DEEPQUERY_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;
const SESSION_FILE: &str = "session.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "token_param",
            Regex::new(r"(?i)([?&](?:token|key|access_token)=)([^&\s]+)")
                .expect("invalid token_param regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9_\-]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// What gets logged about a finished session.
#[derive(Debug, Clone)]
pub struct SessionLogInput {
    pub session_id: String,
    pub topic: String,
    pub outcome: String,
    pub rounds: u32,
    pub queries: Vec<String>,
    pub citations: Vec<String>,
    pub answer_chars: usize,
    pub trace_path: Option<String>,
}

#[derive(Serialize)]
struct SessionLogRecord {
    timestamp: String,
    session_id: String,
    topic: String,
    outcome: String,
    rounds: u32,
    queries: Vec<String>,
    citations: Vec<String>,
    answer_chars: usize,
    trace_path: Option<String>,
    redactions: Vec<&'static str>,
}

#[derive(Serialize)]
struct AuditLogRecord<'a> {
    timestamp: &'a str,
    session_id: &'a str,
    redactions: &'a [&'static str],
}

/// Writer for the monthly `session.jsonl` / `audit.jsonl` files.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    base_dir: PathBuf,
    retention_days: u64,
}

impl SessionLogger {
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
        }
    }

    /// `DEEPQUERY_LOG_DIR` (default `data/logs`) and
    /// `DEEPQUERY_LOG_RETENTION_DAYS` (default 90, 0 disables pruning).
    pub fn from_env() -> Self {
        let base_dir = std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
        let retention_days = std::env::var(RETENTION_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self::new(base_dir, retention_days)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_completion(&self, input: SessionLogInput) -> Result<PathBuf> {
        let now = Utc::now();
        let mut redactions = BTreeSet::new();
        let mut clean = |text: &str| redact(text, &mut redactions);

        let topic = clean(&input.topic);
        let queries: Vec<String> = input.queries.iter().map(|query| clean(query)).collect();
        let record = SessionLogRecord {
            timestamp: now.to_rfc3339(),
            session_id: input.session_id,
            topic,
            outcome: input.outcome,
            rounds: input.rounds,
            queries,
            citations: input.citations,
            answer_chars: input.answer_chars,
            trace_path: input.trace_path,
            redactions: redactions.into_iter().collect(),
        };

        let month_dir = self
            .base_dir
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        let session_path = month_dir.join(SESSION_FILE);
        append_json_line(&session_path, &record)?;

        if !record.redactions.is_empty() {
            let audit = AuditLogRecord {
                timestamp: &record.timestamp,
                session_id: &record.session_id,
                redactions: &record.redactions,
            };
            append_json_line(&month_dir.join(AUDIT_FILE), &audit)?;
            warn!(
                session_id = %record.session_id,
                fields = ?record.redactions,
                "redacted potential secrets from session log"
            );
        }

        self.prune()?;
        Ok(session_path)
    }

    /// Delete every file older than the retention window.
    pub fn prune(&self) -> Result<()> {
        if self.retention_days == 0 || !self.base_dir.exists() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.retention_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        prune_directory(&self.base_dir, cutoff)
    }

    /// Remove every record of `session_id`; returns how many lines were dropped.
    pub fn remove_session(&self, session_id: &str) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for year in subdirectories(&self.base_dir)? {
            for month in subdirectories(&year)? {
                for name in [SESSION_FILE, AUDIT_FILE] {
                    removed += rewrite_without(&month.join(name), session_id)?;
                }
                remove_if_empty_dir(&month)?;
            }
            remove_if_empty_dir(&year)?;
        }
        Ok(removed)
    }
}

/// Append a completion record using the environment-configured logger.
pub fn log_session_completion(input: SessionLogInput) -> Result<PathBuf> {
    SessionLogger::from_env().log_completion(input)
}

/// Remove a session's records using the environment-configured logger.
pub fn remove_session_logs(session_id: &str) -> Result<usize> {
    SessionLogger::from_env().remove_session(session_id)
}

fn redact(input: &str, redactions: &mut BTreeSet<&'static str>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        if !regex.is_match(&output) {
            continue;
        }
        output = regex
            .replace_all(&output, |caps: &Captures| match caps.get(2) {
                Some(_) => format!("{}[REDACTED]", &caps[1]),
                None => "[REDACTED]".to_string(),
            })
            .into_owned();
        redactions.insert(name);
    }
    output
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writeln!(writer)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            remove_if_empty_dir(&path)?;
        } else if metadata.is_file()
            && metadata.modified().map(|time| time < cutoff).unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn remove_if_empty_dir(dir: &Path) -> Result<()> {
    if dir.read_dir()?.next().is_none() {
        fs::remove_dir(dir).ok();
    }
    Ok(())
}

fn rewrite_without(path: &Path, session_id: &str) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }

    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut retained = Vec::new();
    let mut removed = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let matches = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|value| value.get("session_id").and_then(|id| id.as_str()).map(|id| id == session_id))
            .unwrap_or(false);
        if matches {
            removed += 1;
        } else {
            retained.push(line);
        }
    }

    if removed == 0 {
        return Ok(0);
    }
    if retained.is_empty() {
        fs::remove_file(path).ok();
        return Ok(removed);
    }

    let file = File::create(path)
        .with_context(|| format!("failed to rewrite log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for line in retained {
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input(session_id: &str, topic: &str) -> SessionLogInput {
        SessionLogInput {
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            outcome: "answered".to_string(),
            rounds: 1,
            queries: vec!["search https://x.test/?token=abc123".to_string()],
            citations: vec!["arxiv".to_string()],
            answer_chars: 420,
            trace_path: None,
        }
    }

    #[test]
    fn completion_records_are_redacted_and_audited() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let logger = SessionLogger::new(temp.path(), 0);

        let path = logger.log_completion(input("s-1", "why is api_key=hunter2 leaking"))?;
        let line = fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;

        assert_eq!(record["session_id"], "s-1");
        assert_eq!(record["topic"], "why is api_key=[REDACTED] leaking");
        assert!(record["queries"][0].as_str().unwrap().contains("token=[REDACTED]"));
        assert!(path.with_file_name(AUDIT_FILE).exists());
        Ok(())
    }

    #[test]
    fn remove_session_keeps_other_sessions() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let logger = SessionLogger::new(temp.path(), 0);
        let path = logger.log_completion(input("keep", "plain topic"))?;
        logger.log_completion(input("drop", "plain topic"))?;

        assert_eq!(logger.remove_session("drop")?, 2);
        let remaining = fs::read_to_string(&path)?;
        assert_eq!(remaining.lines().count(), 1);
        assert!(remaining.contains("\"keep\""));
        Ok(())
    }

    #[test]
    fn removing_last_session_cleans_up_directories() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let logger = SessionLogger::new(temp.path(), 0);
        logger.log_completion(input("only", "plain topic"))?;

        logger.remove_session("only")?;
        assert!(temp.path().read_dir()?.next().is_none());
        Ok(())
    }
}
