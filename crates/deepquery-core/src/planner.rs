//! Query planning: turns a research topic (and, after the first round, the
//! evidence gathered so far) into a bounded list of search queries.
//!
//! The planner delegates the creative part to the text generator and then
//! enforces the contract itself: JSON is validated, queries are truncated,
//! near-duplicates and previously issued queries are dropped, the list is
//! capped at the per-round budget, and topics that obviously decompose into
//! several aspects get one query per aspect.

use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::backends::DynTextGenerator;
use crate::error::{DeepQueryError, PlanningError};
use crate::model::{MAX_QUERY_CHARS, Query, ResearchTopic, RoundSummary};
use crate::text::{extract_json_object, keywords, leading_sentences, token_similarity};

/// Queries at or above this token-set similarity are treated as duplicates.
pub const NEAR_DUPLICATE_SIMILARITY: f64 = 0.85;

const FINDINGS_PREVIEW_CHARS: usize = 600;

static ASPECT_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(?:vs\.?|versus|compared\s+(?:to|with)|against)\s+|\s*;\s*")
        .expect("invalid aspect separator regex")
});

static COMPARISON_AND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+and\s+").expect("invalid comparison regex"));

static LEADING_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:compare|comparing|contrast|the\s+difference\s+between|difference\s+between)\s+")
        .expect("invalid leading verb regex")
});

/// Everything the planner needs to know about the session so far.
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub topic: &'a ResearchTopic,
    pub round: u32,
    pub previous_rounds: &'a [RoundSummary],
    /// Aspects the last coverage evaluation found missing.
    pub gaps: &'a [String],
    /// Query texts issued in earlier rounds.
    pub issued: &'a [String],
}

/// Output of one planning step.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub rationale: String,
    pub queries: Vec<Query>,
    pub response_language: Option<String>,
    /// Sub-aspects of the topic the plan is meant to cover.
    pub aspects: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(query) => vec![query],
            OneOrMany::Many(queries) => queries,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlannerOutput {
    #[serde(default)]
    rationale: String,
    #[serde(alias = "queries")]
    query: OneOrMany,
    #[serde(default)]
    response_language: Option<String>,
    #[serde(default)]
    aspects: Vec<String>,
}

pub struct QueryPlanner {
    generator: DynTextGenerator,
    max_query_chars: usize,
}

impl QueryPlanner {
    pub fn new(generator: DynTextGenerator) -> Self {
        Self {
            generator,
            max_query_chars: MAX_QUERY_CHARS,
        }
    }

    pub fn with_max_query_chars(mut self, max_query_chars: usize) -> Self {
        self.max_query_chars = max_query_chars;
        self
    }

    /// JSON schema handed to the generator alongside the prompt.
    pub fn response_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "rationale": { "type": "string" },
                "query": { "type": "array", "items": { "type": "string" } },
                "response_language": { "type": "string" },
                "aspects": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["rationale", "query", "response_language"]
        })
    }

    /// Plan one round. Retries once with a stricter instruction when the
    /// generator output cannot be used.
    #[instrument(name = "planner.plan", skip(self, ctx), fields(round = ctx.round))]
    pub async fn plan(&self, ctx: PlanningContext<'_>) -> Result<QueryPlan, DeepQueryError> {
        let prompt = self.build_prompt(&ctx);
        let first = match self.attempt(&prompt).await {
            Ok(output) => return Ok(self.finalize(output, &ctx)),
            Err(err) => err,
        };

        warn!(error = %first, "planner output rejected; retrying with strict instruction");
        let strict = format!(
            "{prompt}\n\nYour previous answer was rejected ({first}). Reply with exactly one JSON \
             object and nothing else: no prose, no code fences, and a non-empty \"query\" list."
        );
        match self.attempt(&strict).await {
            Ok(output) => Ok(self.finalize(output, &ctx)),
            Err(err) => Err(DeepQueryError::FatalPlanning(err)),
        }
    }

    async fn attempt(&self, prompt: &str) -> Result<PlannerOutput, PlanningError> {
        let schema = Self::response_schema();
        let raw = self
            .generator
            .generate(prompt, Some(&schema))
            .await
            .map_err(|err| PlanningError::Generation(err.to_string()))?;
        parse_planner_output(&raw)
    }

    fn finalize(&self, output: PlannerOutput, ctx: &PlanningContext<'_>) -> QueryPlan {
        let budget = ctx.topic.number_queries();
        let rationale = output.rationale.trim().to_string();

        let mut accepted: Vec<String> = Vec::new();
        let issued: Vec<&str> = ctx.issued.iter().map(String::as_str).collect();
        for candidate in output.query.into_vec() {
            let query = Query::new(&candidate, "", ctx.round, self.max_query_chars);
            if query.text().is_empty() {
                continue;
            }
            if is_near_duplicate(query.text(), accepted.iter().map(String::as_str))
                || is_near_duplicate(query.text(), issued.iter().copied())
            {
                debug!(query = %query.text(), "dropping near-duplicate query");
                continue;
            }
            accepted.push(query.text().to_string());
        }

        let aspects: Vec<String> = if !output.aspects.is_empty() {
            output
                .aspects
                .into_iter()
                .map(|aspect| aspect.trim().to_string())
                .filter(|aspect| !aspect.is_empty())
                .collect()
        } else if ctx.round == 1 {
            split_aspects(ctx.topic.question())
        } else {
            ctx.gaps.to_vec()
        };

        // Breadth: one query per aspect the model's queries leave untouched.
        let wanted_aspects = if ctx.round == 1 { &aspects[..] } else { ctx.gaps };
        for aspect in wanted_aspects {
            if accepted.len() >= budget {
                break;
            }
            if aspect_represented(aspect, &accepted) {
                continue;
            }
            let query = Query::new(aspect, "", ctx.round, self.max_query_chars);
            if query.text().is_empty()
                || is_near_duplicate(query.text(), accepted.iter().map(String::as_str))
                || is_near_duplicate(query.text(), issued.iter().copied())
            {
                continue;
            }
            debug!(aspect = %aspect, "adding query for uncovered aspect");
            accepted.push(query.text().to_string());
        }

        accepted.truncate(budget);
        let queries = accepted
            .iter()
            .map(|text| Query::new(text, rationale.clone(), ctx.round, self.max_query_chars))
            .collect::<Vec<_>>();

        let response_language = output
            .response_language
            .map(|language| language.trim().to_string())
            .filter(|language| !language.is_empty());

        info!(
            queries = queries.len(),
            aspects = aspects.len(),
            "query plan ready"
        );

        QueryPlan {
            rationale,
            queries,
            response_language,
            aspects,
        }
    }

    fn build_prompt(&self, ctx: &PlanningContext<'_>) -> String {
        let topic = ctx.topic;
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You plan web searches for a research assistant. The current date is {}.",
            Utc::now().format("%B %-d, %Y")
        );
        let _ = writeln!(prompt, "\nResearch topic: {}", topic.question());
        let _ = writeln!(
            prompt,
            "This is search round {} of at most {}. Produce between 1 and {} search queries, \
             each shorter than {} characters.",
            ctx.round,
            topic.max_rounds(),
            topic.number_queries(),
            self.max_query_chars
        );
        prompt.push_str(
            "\nRules:\n\
             - If the topic spans several independent aspects, or sources in several languages \
             are relevant, write one focused query per aspect instead of one broad query.\n\
             - Never write two queries that differ only in wording.\n\
             - Prefer queries that surface recent, authoritative sources.\n",
        );

        let aspects = split_aspects(topic.question());
        if ctx.round == 1 && aspects.len() > 1 {
            prompt.push_str("\nThe topic appears to contain these aspects:\n");
            for aspect in &aspects {
                let _ = writeln!(prompt, "- {aspect}");
            }
        }

        if !ctx.issued.is_empty() {
            prompt.push_str("\nAlready searched (do not repeat):\n");
            for query in ctx.issued {
                let _ = writeln!(prompt, "- {query}");
            }
        }

        if !ctx.previous_rounds.is_empty() {
            prompt.push_str("\nFindings so far:\n");
            for result in ctx.previous_rounds.iter().flat_map(|round| round.successful()) {
                let _ = writeln!(
                    prompt,
                    "- [{}] {}",
                    result.query.text(),
                    leading_sentences(&result.content, FINDINGS_PREVIEW_CHARS)
                );
            }
        }

        if !ctx.gaps.is_empty() {
            prompt.push_str("\nKnowledge gaps to close in this round:\n");
            for gap in ctx.gaps {
                let _ = writeln!(prompt, "- {gap}");
            }
        }

        let language_hint = topic
            .response_language()
            .map(|language| format!(" Use \"{language}\" for response_language."))
            .unwrap_or_else(|| {
                " Set response_language to the language the topic is written in.".to_string()
            });
        let _ = write!(
            prompt,
            "\nRespond with a JSON object: {{\"rationale\": string, \"query\": [string], \
             \"response_language\": string, \"aspects\": [string]}}.{language_hint}"
        );
        prompt
    }
}

fn parse_planner_output(raw: &str) -> Result<PlannerOutput, PlanningError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| PlanningError::Unparsable("no JSON object in planner output".into()))?;
    let output: PlannerOutput = serde_json::from_str(json).map_err(|err| {
        if err.is_data() {
            PlanningError::Schema(err.to_string())
        } else {
            PlanningError::Unparsable(err.to_string())
        }
    })?;

    let non_empty = match &output.query {
        OneOrMany::One(query) => !query.trim().is_empty(),
        OneOrMany::Many(queries) => queries.iter().any(|query| !query.trim().is_empty()),
    };
    if !non_empty {
        return Err(PlanningError::Schema("query list is empty".into()));
    }
    Ok(output)
}

fn normalized(text: &str) -> String {
    crate::text::tokens(text).join(" ")
}

fn is_near_duplicate<'a>(candidate: &str, existing: impl IntoIterator<Item = &'a str>) -> bool {
    let candidate_norm = normalized(candidate);
    existing.into_iter().any(|other| {
        normalized(other) == candidate_norm
            || token_similarity(candidate, other) >= NEAR_DUPLICATE_SIMILARITY
    })
}

fn aspect_represented(aspect: &str, queries: &[String]) -> bool {
    let aspect_keywords = keywords(aspect);
    if aspect_keywords.is_empty() {
        return true;
    }
    queries.iter().any(|query| {
        let query_keywords: HashSet<String> = keywords(query).into_iter().collect();
        let hits = aspect_keywords
            .iter()
            .filter(|word| query_keywords.contains(*word))
            .count();
        hits * 2 >= aspect_keywords.len()
    })
}

/// Split a topic into independent aspects on comparison separators
/// (`vs`, `versus`, `compared to`, `;`). Returns an empty list when the topic
/// does not decompose.
pub fn split_aspects(topic: &str) -> Vec<String> {
    let topic = topic.trim();
    let mut parts = aspect_parts(ASPECT_SEPARATOR.split(topic));

    // "compare X and Y" with no other separator: split on the top-level "and".
    if parts.len() < 2 && LEADING_VERB.is_match(topic) {
        let body = LEADING_VERB.replace(topic, "");
        parts = aspect_parts(COMPARISON_AND.split(&body));
    }

    if parts.len() < 2 { Vec::new() } else { parts }
}

fn aspect_parts<'a>(pieces: impl Iterator<Item = &'a str>) -> Vec<String> {
    pieces
        .map(|part| {
            let part = LEADING_VERB.replace(part.trim(), "");
            part.trim_matches(|c: char| c.is_whitespace() || matches!(c, '?' | '.' | ','))
                .to_string()
        })
        .filter(|part| !keywords(part).is_empty())
        .collect()
}
