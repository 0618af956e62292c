//! Final answer synthesis with citation validation.
//!
//! Generated answers may only cite labels the registry issued. A draft that
//! cites anything else, or drops too many of the sources the summaries rely
//! on, gets one stricter retry. If no usable draft results, the answer is
//! assembled extractively from the summaries so that a citation integrity
//! failure never reaches the user.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::backends::DynTextGenerator;
use crate::citation::CitationRegistry;
use crate::error::DeepQueryError;
use crate::model::{FinalAnswer, ResearchTopic, RoundSummary};
use crate::text::{escape_brackets, extract_fenced_block};

/// Minimum share of summary-cited labels a draft has to keep.
pub const DEFAULT_RETENTION_THRESHOLD: f64 = 0.8;

/// Share of all citations above which a single label counts as over-used.
const CONCENTRATION_WARNING: f64 = 0.6;

static CITATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([A-Za-z0-9_\-]+(?:\s*,\s*[A-Za-z0-9_\-]+)*)\](\()?")
        .expect("invalid citation regex")
});

/// Every `[label]` occurrence in `markdown`, in order. Markdown links
/// (`[text](url)`), escaped brackets (`\[x]`) and task-list boxes (`- [x]`)
/// are skipped; `[a, b]` yields both labels.
pub fn extract_citations(markdown: &str) -> Vec<String> {
    CITATION
        .captures_iter(markdown)
        .filter(|caps| caps.get(2).is_none())
        .filter(|caps| {
            let start = caps.get(0).map_or(0, |m| m.start());
            let before = &markdown[..start];
            let group = caps.get(1).map_or("", |m| m.as_str());
            !before.ends_with('\\') && !is_task_box(before, group)
        })
        .filter_map(|caps| caps.get(1))
        .flat_map(|group| {
            group
                .as_str()
                .split(',')
                .map(|label| label.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|label| !label.is_empty())
        .collect()
}

fn is_task_box(before: &str, group: &str) -> bool {
    let line = before.rsplit('\n').next().unwrap_or(before).trim();
    matches!(group, "x" | "X") && matches!(line, "-" | "*" | "+")
}

/// Escape bracketed terms that the question itself contains (`[CLS]`) and
/// the registry never issued, so quoting the question is not a citation.
fn escape_question_terms(markdown: &str, question: &str, registry: &CitationRegistry) -> String {
    let mut markdown = markdown.to_string();
    for term in extract_citations(question) {
        if registry.contains(&term) {
            continue;
        }
        markdown = markdown.replace(&format!("[{term}]"), &format!("\\[{term}\\]"));
    }
    markdown
}

/// Distinct citations in order of first appearance, or a
/// `CitationIntegrity` error naming every label the registry never issued.
pub fn validate_citations(
    markdown: &str,
    registry: &CitationRegistry,
) -> Result<Vec<String>, DeepQueryError> {
    let mut seen = HashSet::new();
    let mut used = Vec::new();
    let mut unknown = Vec::new();
    for label in extract_citations(markdown) {
        if !seen.insert(label.clone()) {
            continue;
        }
        if registry.contains(&label) {
            used.push(label);
        } else {
            unknown.push(label);
        }
    }

    if unknown.is_empty() {
        Ok(used)
    } else {
        Err(DeepQueryError::CitationIntegrity { labels: unknown })
    }
}

/// Share of the labels cited by successful summaries that the answer kept.
pub fn source_retention(cited: &[String], rounds: &[RoundSummary]) -> f64 {
    let expected: HashSet<&str> = rounds
        .iter()
        .flat_map(|round| round.successful())
        .flat_map(|result| result.sources.iter().map(String::as_str))
        .collect();
    if expected.is_empty() {
        return 1.0;
    }
    let kept = cited
        .iter()
        .filter(|label| expected.contains(label.as_str()))
        .count();
    kept as f64 / expected.len() as f64
}

/// Largest share of all citation occurrences held by one label.
pub fn citation_concentration(markdown: &str) -> Option<(String, f64)> {
    let citations = extract_citations(markdown);
    if citations.is_empty() {
        return None;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in &citations {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(label, count)| (label.to_string(), count as f64 / citations.len() as f64))
}

enum Rejection {
    Generation(String),
    Integrity(Vec<String>),
    LowRetention { retention: f64, draft: FinalAnswer },
}

impl Rejection {
    fn instruction(&self) -> String {
        match self {
            Rejection::Generation(_) => {
                "Your previous answer could not be produced. Answer again, inside a fenced code block."
                    .to_string()
            }
            Rejection::Integrity(labels) => format!(
                "Your previous answer cited labels that do not exist: {}. Cite only labels from the \
                 list of sources, exactly as written.",
                labels.join(", ")
            ),
            Rejection::LowRetention { retention, .. } => format!(
                "Your previous answer only used {:.0}% of the available sources. Keep the \
                 information and citations of at least 80% of them.",
                retention * 100.0
            ),
        }
    }
}

pub struct AnswerSynthesizer {
    generator: DynTextGenerator,
    retention_threshold: f64,
}

impl AnswerSynthesizer {
    pub fn new(generator: DynTextGenerator) -> Self {
        Self {
            generator,
            retention_threshold: DEFAULT_RETENTION_THRESHOLD,
        }
    }

    pub fn with_retention_threshold(mut self, threshold: f64) -> Self {
        self.retention_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Produce the session's final answer. Never fails: unusable drafts end
    /// in the extractive fallback.
    #[instrument(
        name = "synthesizer.synthesize",
        skip(self, topic, rounds, registry),
        fields(rounds = rounds.len(), sources = registry.len())
    )]
    pub async fn synthesize(
        &self,
        topic: &ResearchTopic,
        language: Option<&str>,
        rounds: &[RoundSummary],
        registry: &CitationRegistry,
    ) -> FinalAnswer {
        let prompt = self.build_prompt(topic, language, rounds, registry);

        let question = topic.question();
        let rejection = match self.attempt(&prompt, question, rounds, registry).await {
            Ok(answer) => return self.accept(answer),
            Err(rejection) => rejection,
        };
        warn!(reason = %rejection.instruction(), "synthesis draft rejected; retrying");

        let strict = format!("{prompt}\n\n{}", rejection.instruction());
        let earlier_draft = match rejection {
            Rejection::LowRetention { draft, .. } => Some(draft),
            _ => None,
        };

        match self.attempt(&strict, question, rounds, registry).await {
            Ok(answer) => self.accept(answer),
            Err(Rejection::LowRetention { retention, draft }) => {
                warn!(retention, "accepting draft below retention threshold");
                self.accept(draft)
            }
            Err(second) => match earlier_draft {
                Some(draft) => self.accept(draft),
                None => {
                    warn!(
                        reason = %second.instruction(),
                        "synthesis failed twice; rendering extractive answer"
                    );
                    extractive_answer(topic, rounds, registry)
                }
            },
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        question: &str,
        rounds: &[RoundSummary],
        registry: &CitationRegistry,
    ) -> Result<FinalAnswer, Rejection> {
        let raw = self
            .generator
            .generate(prompt, None)
            .await
            .map_err(|err| Rejection::Generation(err.to_string()))?;
        let markdown = escape_question_terms(extract_fenced_block(&raw), question, registry);
        if markdown.is_empty() {
            return Err(Rejection::Generation("empty answer".into()));
        }

        let citations_used = match validate_citations(&markdown, registry) {
            Ok(used) => used,
            Err(DeepQueryError::CitationIntegrity { labels }) => {
                return Err(Rejection::Integrity(labels));
            }
            Err(err) => return Err(Rejection::Generation(err.to_string())),
        };

        let draft = FinalAnswer {
            markdown,
            citations_used,
        };
        let retention = source_retention(&draft.citations_used, rounds);
        if retention < self.retention_threshold {
            return Err(Rejection::LowRetention { retention, draft });
        }
        Ok(draft)
    }

    fn accept(&self, answer: FinalAnswer) -> FinalAnswer {
        if let Some((label, share)) = citation_concentration(&answer.markdown) {
            if share > CONCENTRATION_WARNING && answer.citations_used.len() > 1 {
                warn!(%label, share, "citations concentrate on one source");
            } else {
                info!(%label, share, "citation concentration");
            }
        }
        info!(citations = answer.citations_used.len(), "final answer ready");
        answer
    }

    fn build_prompt(
        &self,
        topic: &ResearchTopic,
        language: Option<&str>,
        rounds: &[RoundSummary],
        registry: &CitationRegistry,
    ) -> String {
        let language = language
            .map(|language| format!("in {language}"))
            .unwrap_or_else(|| "in the language of the research topic".to_string());

        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You write the final report of a research assistant. The current date is {}.",
            Utc::now().format("%B %-d, %Y")
        );
        let _ = writeln!(prompt, "\nResearch topic: {}", topic.question());
        let _ = write!(
            prompt,
            "\nRules:\n\
             - Preserve at least 80% of the information in the notes below.\n\
             - Cite sources as [label], using only the labels listed under Sources.\n\
             - When several sources support a claim, list all of them next to each other, \
             e.g. [a][b].\n\
             - Spread citations across independent sources instead of relying on one.\n\
             - Write well-structured markdown (title, sections, lists or tables) {language}.\n\
             - Write square brackets that are not citations as \\[ and \\].\n\
             - Wrap the whole answer in a single fenced code block.\n"
        );

        prompt.push_str("\nSources:\n");
        for record in registry.records() {
            let title = if record.title.is_empty() {
                record.url.as_str()
            } else {
                record.title.as_str()
            };
            let _ = writeln!(prompt, "- [{}] {}", record.label, title);
        }

        prompt.push_str("\nNotes:\n");
        for round in rounds {
            for result in round.successful() {
                let _ = writeln!(prompt, "\n### {}\n{}", result.query.text(), result.content);
            }
        }
        prompt
    }
}

/// Deterministic answer built from the summaries themselves.
pub fn extractive_answer(
    topic: &ResearchTopic,
    rounds: &[RoundSummary],
    registry: &CitationRegistry,
) -> FinalAnswer {
    let mut markdown = format!("# {}\n", escape_brackets(topic.question()));

    for result in rounds.iter().flat_map(|round| round.successful()) {
        let lines: Vec<&str> = result
            .content
            .lines()
            .filter(|line| {
                extract_citations(line)
                    .iter()
                    .all(|label| registry.contains(label))
            })
            .collect();
        if lines.is_empty() {
            continue;
        }
        let _ = write!(
            markdown,
            "\n## {}\n\n{}\n",
            escape_brackets(result.query.text()),
            lines.join("\n")
        );
    }

    let mut seen = HashSet::new();
    let citations_used: Vec<String> = extract_citations(&markdown)
        .into_iter()
        .filter(|label| registry.contains(label) && seen.insert(label.clone()))
        .collect();

    if !citations_used.is_empty() {
        markdown.push_str("\n## Sources\n\n");
        for label in &citations_used {
            if let Some(record) = registry.get(label) {
                let _ = writeln!(markdown, "- {label}: <{}>", record.url);
            }
        }
    }

    FinalAnswer {
        markdown,
        citations_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ScriptedGenerator;
    use crate::model::{MAX_QUERY_CHARS, Query, QuerySummary};
    use std::sync::Arc;

    fn fixture() -> (ResearchTopic, Vec<RoundSummary>, CitationRegistry) {
        let topic = ResearchTopic::new("How do mRNA vaccines work?", 2, 1).unwrap();
        let mut registry = CitationRegistry::new();
        let nih = registry.register("https://www.nih.gov/mrna");
        let cdc = registry.register("https://www.cdc.gov/vaccines/mrna");
        let rounds = vec![RoundSummary {
            round: 1,
            rationale: "basics".into(),
            results: vec![
                QuerySummary {
                    query: Query::new("mrna vaccine mechanism", "r", 1, MAX_QUERY_CHARS),
                    sources: vec![nih.clone()],
                    content: format!("- mRNA instructs cells to make a spike protein. [{nih}]"),
                    failure: None,
                },
                QuerySummary {
                    query: Query::new("mrna vaccine safety", "r", 1, MAX_QUERY_CHARS),
                    sources: vec![cdc.clone()],
                    content: format!("- mRNA degrades within days. [{cdc}]"),
                    failure: None,
                },
            ],
        }];
        (topic, rounds, registry)
    }

    #[test]
    fn citations_skip_markdown_links_and_split_groups() {
        let text = "Claim [nih][cdc]. See [docs](https://x.y) and [a, b].";
        assert_eq!(extract_citations(text), vec!["nih", "cdc", "a", "b"]);
    }

    #[test]
    fn escaped_brackets_and_task_boxes_are_not_citations() {
        let text = "Use \\[CLS\\] here.\n- [x] done [nih]\n- [ ] open\nAn [x] in prose.";
        assert_eq!(extract_citations(text), vec!["nih", "x"]);
    }

    #[test]
    fn extractive_answer_escapes_bracketed_question() {
        let topic = ResearchTopic::new("What does the [CLS] token do in BERT?", 1, 1).unwrap();
        let mut registry = CitationRegistry::new();
        let arxiv = registry.register("https://arxiv.org/abs/1810.04805");
        let rounds = vec![RoundSummary {
            round: 1,
            rationale: "basics".into(),
            results: vec![QuerySummary {
                query: Query::new("[CLS] token BERT", "r", 1, MAX_QUERY_CHARS),
                sources: vec![arxiv.clone()],
                content: format!("- The \\[CLS\\] state feeds the classifier. [{arxiv}]"),
                failure: None,
            }],
        }];

        let answer = extractive_answer(&topic, &rounds, &registry);
        assert!(answer.markdown.starts_with("# What does the \\[CLS\\] token"));
        assert_eq!(answer.citations_used, vec!["arxiv"]);
        assert!(validate_citations(&answer.markdown, &registry).is_ok());
    }

    #[tokio::test]
    async fn quoting_a_bracketed_question_is_not_an_integrity_error() {
        let (_, rounds, registry) = fixture();
        let topic = ResearchTopic::new("How do [mRNA] vaccines work?", 2, 1).unwrap();
        let generator = Arc::new(ScriptedGenerator::new([
            "```\n# How do [mRNA] vaccines work?\n\nSpike protein [nih]. Degrades [cdc].\n```",
        ]));
        let synthesizer = AnswerSynthesizer::new(generator.clone());
        let answer = synthesizer.synthesize(&topic, None, &rounds, &registry).await;

        assert_eq!(generator.prompts().len(), 1);
        assert!(answer.markdown.starts_with("# How do \\[mRNA\\] vaccines"));
        assert_eq!(answer.citations_used, vec!["nih", "cdc"]);
    }

    #[test]
    fn unknown_labels_are_integrity_errors() {
        let (_, _, registry) = fixture();
        let err = validate_citations("Fact [nih] and [made_up].", &registry).unwrap_err();
        assert!(matches!(
            err,
            DeepQueryError::CitationIntegrity { ref labels } if labels == &["made_up".to_string()]
        ));
    }

    #[test]
    fn citations_used_are_deduplicated_in_first_appearance_order() {
        let (_, _, registry) = fixture();
        let used = validate_citations("[cdc] then [nih] then [cdc]", &registry).unwrap();
        assert_eq!(used, vec!["cdc", "nih"]);
    }

    #[test]
    fn concentration_reports_dominant_label() {
        let (label, share) = citation_concentration("[a] [a] [a] [b]").unwrap();
        assert_eq!(label, "a");
        assert!((share - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn valid_answer_is_accepted_from_fence() {
        let (topic, rounds, registry) = fixture();
        let generator = Arc::new(ScriptedGenerator::new([
            "```markdown\n# mRNA vaccines\n\nCells make spike protein [nih]. mRNA degrades [cdc].\n```",
        ]));
        let synthesizer = AnswerSynthesizer::new(generator.clone());
        let answer = synthesizer.synthesize(&topic, Some("English"), &rounds, &registry).await;

        assert!(answer.markdown.starts_with("# mRNA vaccines"));
        assert_eq!(answer.citations_used, vec!["nih", "cdc"]);
        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("- [nih]"));
        assert!(prompt.contains("in English"));
    }

    #[tokio::test]
    async fn dangling_label_triggers_one_retry() {
        let (topic, rounds, registry) = fixture();
        let generator = Arc::new(ScriptedGenerator::new([
            "Spike protein [wikipedia]. Degrades [cdc].",
            "Spike protein [nih]. Degrades [cdc].",
        ]));
        let synthesizer = AnswerSynthesizer::new(generator.clone());
        let answer = synthesizer.synthesize(&topic, None, &rounds, &registry).await;

        assert_eq!(answer.citations_used, vec!["nih", "cdc"]);
        assert!(generator.prompts()[1].contains("do not exist: wikipedia"));
    }

    #[tokio::test]
    async fn repeated_integrity_failure_falls_back_to_extractive_answer() {
        let (topic, rounds, registry) = fixture();
        let generator = Arc::new(ScriptedGenerator::new(["[ghost]", "[ghost] again"]));
        let synthesizer = AnswerSynthesizer::new(generator);
        let answer = synthesizer.synthesize(&topic, None, &rounds, &registry).await;

        assert!(answer.markdown.starts_with("# How do mRNA vaccines work?"));
        assert_eq!(answer.citations_used, vec!["nih", "cdc"]);
        assert!(validate_citations(&answer.markdown, &registry).is_ok());
    }

    #[tokio::test]
    async fn low_retention_retries_then_keeps_best_draft() {
        let (topic, rounds, registry) = fixture();
        let generator = Arc::new(ScriptedGenerator::new(["Only [nih]."]));
        generator.push_error("backend down");
        let synthesizer = AnswerSynthesizer::new(generator.clone());
        let answer = synthesizer.synthesize(&topic, None, &rounds, &registry).await;

        assert_eq!(answer.markdown, "Only [nih].");
        assert!(generator.prompts()[1].contains("50%"));
    }

    #[tokio::test]
    async fn generator_outage_still_yields_an_answer() {
        let (topic, rounds, registry) = fixture();
        let synthesizer = AnswerSynthesizer::new(Arc::new(ScriptedGenerator::default()));
        let answer = synthesizer.synthesize(&topic, None, &rounds, &registry).await;
        assert!(answer.markdown.contains("## Sources"));
        assert_eq!(answer.citations_used.len(), 2);
    }
}
