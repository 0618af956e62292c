//! Small text helpers shared by planning, summarizing and coverage checks.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("invalid token regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid whitespace regex"));

const MIN_KEYWORD_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "because", "been", "before", "being", "between",
    "but", "can", "compare", "compared", "comparison", "could", "did", "does", "during", "each",
    "for", "from", "had", "has", "have", "how", "into", "its", "last", "more", "most", "not",
    "other", "over", "such", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "under", "versus", "was", "were", "what", "when",
    "where", "which", "while", "who", "why", "will", "with", "would", "you", "your",
];

/// Lower-cased word tokens.
pub fn tokens(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Distinct content words (≥ 3 chars, stop-words removed), in first-seen order.
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens(text)
        .into_iter()
        .filter(|token| token.chars().count() >= MIN_KEYWORD_CHARS)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Escape square brackets so plain text never reads as a `[label]` citation.
pub fn escape_brackets(text: &str) -> String {
    text.replace('[', "\\[").replace(']', "\\]")
}

/// Jaccard similarity of the token sets of two strings.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = tokens(a).into_iter().collect();
    let right: HashSet<String> = tokens(b).into_iter().collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Collapse runs of whitespace into single spaces.
pub fn squash_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Leading whole sentences of `text` fitting in `max_chars`.
///
/// A first sentence longer than the budget is cut on a char boundary and
/// marked with an ellipsis.
pub fn leading_sentences(text: &str, max_chars: usize) -> String {
    let text = squash_whitespace(text);
    if text.chars().count() <= max_chars {
        return text;
    }

    let mut output = String::new();
    let mut output_chars = 0;
    for sentence in split_sentences(&text) {
        let len = sentence.chars().count() + usize::from(!output.is_empty());
        if output_chars + len > max_chars {
            break;
        }
        if !output.is_empty() {
            output.push(' ');
        }
        output.push_str(sentence);
        output_chars += len;
    }

    if output.is_empty() {
        let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        cut.truncate(cut.trim_end().len());
        cut.push('…');
        return cut;
    }
    output
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?' | '。') {
            let end = idx + ch.len_utf8();
            let at_boundary = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary || ch == '。' {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// First balanced JSON object in `raw`, ignoring code fences and surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Body of the first fenced code block, or the trimmed input when there is none.
///
/// An opening fence without a closing one yields everything after the fence.
pub fn extract_fenced_block(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw.trim();
    };
    let after_fence = &raw[open + 3..];
    let body_start = after_fence.find('\n').map(|idx| idx + 1).unwrap_or(after_fence.len());
    let body = &after_fence[body_start..];
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}
