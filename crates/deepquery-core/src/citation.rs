//! Session-wide source registry issuing stable, human-readable citation labels.
//!
//! Labels are derived from a URL's domain (`https://en.wikipedia.org/wiki/X`
//! becomes `wikipedia`). A second, different URL that would map to an already
//! issued label gets a suffix taken from its path (`wikipedia_X`), falling back
//! to a counter. Once issued a label is never removed or renamed, so citations
//! stay valid for the whole session.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

const FALLBACK_LABEL: &str = "source";
const MAX_SUFFIX_CHARS: usize = 48;

const COMMON_SUBDOMAINS: &[&str] = &["www", "www2", "m", "mobile", "amp", "en", "web"];

const TWO_LEVEL_SUFFIXES: &[&str] = &[
    "co.uk", "ac.uk", "gov.uk", "org.uk", "com.au", "net.au", "org.au", "co.jp", "ac.jp",
    "co.in", "com.br", "com.cn", "co.nz", "co.kr", "com.sg", "com.mx",
];

/// A retrieved document as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub url: String,
    pub label: String,
    pub title: String,
    pub content: String,
}

/// Heuristic turning a URL into a display label.
pub trait LabelStrategy: Send + Sync {
    /// Primary label for a URL, usually derived from its domain.
    fn base_label(&self, url: &Url) -> String;

    /// Distinguishing fragment appended when the base label is already taken.
    fn disambiguator(&self, url: &Url) -> Option<String>;
}

/// Default strategy: registrable domain name, disambiguated by the last path segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomainLabeler;

impl LabelStrategy for DomainLabeler {
    fn base_label(&self, url: &Url) -> String {
        let Some(host) = url.host_str() else {
            return FALLBACK_LABEL.to_string();
        };
        let host = host.to_ascii_lowercase();

        if host.parse::<std::net::IpAddr>().is_ok() {
            return sanitize_label(&host.replace(['.', ':'], "_"));
        }

        let parts = registrable_parts(&host);
        parts
            .last()
            .map(|name| sanitize_label(name))
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| FALLBACK_LABEL.to_string())
    }

    fn disambiguator(&self, url: &Url) -> Option<String> {
        let from_path = url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
            .map(|segment| sanitize_label(&segment));

        if let Some(suffix) = from_path.filter(|suffix| !suffix.is_empty()) {
            return Some(truncate_suffix(&suffix));
        }

        // Same site, different subdomain (news.bbc.co.uk vs www.bbc.co.uk).
        let host = url.host_str()?.to_ascii_lowercase();
        let parts = registrable_parts(&host);
        if parts.len() > 1 {
            let subdomain = sanitize_label(&parts[..parts.len() - 1].join("_"));
            if !subdomain.is_empty() {
                return Some(truncate_suffix(&subdomain));
            }
        }
        None
    }
}

/// Host labels left after removing common subdomains and the public suffix.
fn registrable_parts(host: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = host.split('.').filter(|part| !part.is_empty()).collect();

    while parts.len() > 2 && COMMON_SUBDOMAINS.contains(&parts[0]) {
        parts.remove(0);
    }

    if parts.len() >= 3 {
        let tail = parts[parts.len() - 2..].join(".");
        if TWO_LEVEL_SUFFIXES.contains(&tail.as_str()) {
            parts.truncate(parts.len() - 2);
            return parts;
        }
    }
    if parts.len() >= 2 {
        parts.truncate(parts.len() - 1);
    }
    parts
}

fn sanitize_label(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            label.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            label.push('_');
            last_was_sep = true;
        }
    }
    label.trim_matches(|c| c == '_' || c == '-').to_string()
}

fn truncate_suffix(suffix: &str) -> String {
    suffix
        .chars()
        .take(MAX_SUFFIX_CHARS)
        .collect::<String>()
        .trim_end_matches(['_', '-'])
        .to_string()
}

/// Parse and normalise a URL so trivially different spellings share one label.
fn canonicalize(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("https://{trimmed}")).ok())
        .filter(|url| url.has_host())?;
    url.set_fragment(None);
    if url.path().len() > 1 && url.path().ends_with('/') {
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);
    }
    Some(url)
}

/// Owns every `SourceRecord` of a session and is the single authority on labels.
pub struct CitationRegistry {
    strategy: Box<dyn LabelStrategy>,
    by_url: HashMap<String, usize>,
    by_label: HashMap<String, usize>,
    records: Vec<SourceRecord>,
}

impl Default for CitationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CitationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CitationRegistry")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::with_strategy(DomainLabeler)
    }

    pub fn with_strategy(strategy: impl LabelStrategy + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
            by_url: HashMap::new(),
            by_label: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Register a URL and return its label. Idempotent per canonical URL.
    pub fn register(&mut self, url: &str) -> String {
        self.register_source(url, "", "")
    }

    /// Register a URL together with its title and content.
    ///
    /// Title and content are only filled in when the existing record lacks them;
    /// the label of a known URL is always returned unchanged.
    pub fn register_source(&mut self, url: &str, title: &str, content: &str) -> String {
        let parsed = canonicalize(url);
        let key = parsed
            .as_ref()
            .map(|url| url.as_str().to_string())
            .unwrap_or_else(|| url.trim().to_string());

        if let Some(&idx) = self.by_url.get(&key) {
            let record = &mut self.records[idx];
            if record.title.is_empty() && !title.is_empty() {
                record.title = title.to_string();
            }
            if record.content.is_empty() && !content.is_empty() {
                record.content = content.to_string();
            }
            return record.label.clone();
        }

        let label = self.issue_label(parsed.as_ref(), &key);
        let idx = self.records.len();
        self.records.push(SourceRecord {
            url: key.clone(),
            label: label.clone(),
            title: title.to_string(),
            content: content.to_string(),
        });
        self.by_url.insert(key, idx);
        self.by_label.insert(label.clone(), idx);

        tracing::debug!(%label, total = self.records.len(), "registered new source");
        label
    }

    fn issue_label(&self, url: Option<&Url>, raw: &str) -> String {
        let (base, suffix) = match url {
            // Strategies may be custom; their output still has to be citable.
            Some(url) => (
                sanitize_label(&self.strategy.base_label(url)),
                self.strategy
                    .disambiguator(url)
                    .map(|suffix| truncate_suffix(&sanitize_label(&suffix)))
                    .filter(|suffix| !suffix.is_empty()),
            ),
            None => (
                FALLBACK_LABEL.to_string(),
                Some(truncate_suffix(&sanitize_label(raw))).filter(|s| !s.is_empty()),
            ),
        };
        let base = if base.is_empty() {
            FALLBACK_LABEL.to_string()
        } else {
            base
        };

        if !self.by_label.contains_key(&base) {
            return base;
        }

        let stem = match suffix {
            Some(suffix) => {
                let candidate = format!("{base}_{suffix}");
                if !self.by_label.contains_key(&candidate) {
                    return candidate;
                }
                candidate
            }
            None => base,
        };

        (2..)
            .map(|n| format!("{stem}_{n}"))
            .find(|candidate| !self.by_label.contains_key(candidate))
            .unwrap_or(stem)
    }

    /// Labels issued so far, in issue order.
    pub fn labels_used(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|record| record.label.clone())
            .collect()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.by_label.contains_key(label)
    }

    pub fn get(&self, label: &str) -> Option<&SourceRecord> {
        self.by_label.get(label).map(|&idx| &self.records[idx])
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut registry = CitationRegistry::new();
        let first = registry.register("https://arxiv.org/abs/2301.00001");
        let second = registry.register("https://arxiv.org/abs/2301.00001");
        assert_eq!(first, "arxiv");
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn canonical_spellings_share_a_label() {
        let mut registry = CitationRegistry::new();
        let a = registry.register("https://Example.com/report/#section-2");
        let b = registry.register("https://example.com/report");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_domain_articles_are_disambiguated() {
        let mut registry = CitationRegistry::new();
        let first = registry.register("https://en.wikipedia.org/wiki/Dendritic_cell");
        let second = registry.register("https://en.wikipedia.org/wiki/T_cell");
        assert_eq!(first, "wikipedia");
        assert_eq!(second, "wikipedia_T_cell");
        assert_ne!(first, second);
    }

    #[test]
    fn repeated_collisions_fall_back_to_counter() {
        let mut registry = CitationRegistry::new();
        let a = registry.register("https://example.com/a/report");
        let b = registry.register("https://example.com/b/report");
        let c = registry.register("https://example.com/c/report");
        assert_eq!(a, "example");
        assert_eq!(b, "example_report");
        assert_eq!(c, "example_report_2");
    }

    #[test]
    fn two_level_suffix_and_subdomains_are_stripped() {
        let mut registry = CitationRegistry::new();
        assert_eq!(registry.register("https://www.bbc.co.uk/news/articles/x1"), "bbc");
        assert_eq!(registry.register("https://news.bbc.co.uk/"), "bbc_news");
        assert_eq!(registry.register("https://docs.python.org/3/"), "python");
    }

    #[test]
    fn percent_encoded_paths_decode_into_suffix() {
        let mut registry = CitationRegistry::new();
        registry.register("https://de.wikipedia.org/wiki/Dendritische_Zelle");
        let label = registry.register("https://de.wikipedia.org/wiki/M%C3%BCnchen");
        assert_eq!(label, "wikipedia_M_nchen");
    }

    #[test]
    fn schemeless_and_garbage_inputs_still_get_labels() {
        let mut registry = CitationRegistry::new();
        assert_eq!(registry.register("arxiv.org/abs/1"), "arxiv");
        let garbage = registry.register("not a url at all");
        assert!(garbage.starts_with("source"));
        assert!(registry.contains(&garbage));
    }

    #[test]
    fn labels_are_never_removed() {
        let mut registry = CitationRegistry::new();
        let urls = [
            "https://arxiv.org/abs/1",
            "https://arxiv.org/abs/2",
            "https://nature.com/articles/x",
            "https://arxiv.org/abs/1",
        ];
        let mut previous = 0;
        for url in urls {
            registry.register(url);
            assert!(registry.labels_used().len() >= previous);
            previous = registry.labels_used().len();
        }
        assert_eq!(registry.labels_used(), vec!["arxiv", "arxiv_2", "nature"]);
    }

    #[test]
    fn register_source_backfills_missing_content() {
        let mut registry = CitationRegistry::new();
        let label = registry.register("https://nature.com/articles/x");
        registry.register_source("https://nature.com/articles/x", "Title", "Body");
        let record = registry.get(&label).unwrap();
        assert_eq!(record.title, "Title");
        assert_eq!(record.content, "Body");
    }

    struct HostLabeler;

    impl LabelStrategy for HostLabeler {
        fn base_label(&self, url: &Url) -> String {
            url.host_str().unwrap_or("x").replace('.', "-")
        }

        fn disambiguator(&self, _url: &Url) -> Option<String> {
            None
        }
    }

    struct SpacedLabeler;

    impl LabelStrategy for SpacedLabeler {
        fn base_label(&self, url: &Url) -> String {
            format!("{} site", url.host_str().unwrap_or("x"))
        }

        fn disambiguator(&self, url: &Url) -> Option<String> {
            Some(url.path().to_string())
        }
    }

    #[test]
    fn custom_strategy_output_is_sanitized() {
        let mut registry = CitationRegistry::with_strategy(SpacedLabeler);
        let first = registry.register("https://docs.rs/tokio");
        let second = registry.register("https://docs.rs/serde/latest");
        assert_eq!(first, "docs_rs_site");
        assert_eq!(second, "docs_rs_site_serde_latest");
        assert_eq!(
            crate::synthesizer::extract_citations(&format!("[{first}] [{second}]")),
            vec![first, second]
        );
    }

    #[test]
    fn custom_strategy_is_used() {
        let mut registry = CitationRegistry::with_strategy(HostLabeler);
        assert_eq!(registry.register("https://en.wikipedia.org/wiki/A"), "en-wikipedia-org");
        assert_eq!(
            registry.register("https://en.wikipedia.org/wiki/B"),
            "en-wikipedia-org_2"
        );
    }
}
