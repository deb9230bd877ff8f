//! Full-text term extraction
//!
//! Pipeline: UAX#29 word boundaries, strip possessives, keep alphanumerics,
//! lowercase, drop one-character tokens, drop stopwords. No stemming: the
//! index answers "which items mention these words", not relevance ranking.

use itemdb_core::Value;
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

#[inline]
fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

#[inline]
fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("\u{2019}s"))
        .unwrap_or(word)
}

/// Split text into index terms, in order of appearance.
///
/// ```
/// use itemdb_engine::text::tokenize;
///
/// assert_eq!(tokenize("The Director's Cut"), vec!["director", "cut"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(strip_possessive)
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .map(|w| w.to_lowercase())
        .filter(|s| s.chars().count() >= 2)
        .filter(|s| !is_stopword(s))
        .collect()
}

/// Terms with duplicates removed, first occurrence kept
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Searchable text carried by a value.
///
/// Strings index as themselves; lists, sets and dictionaries contribute
/// their string members. Other literals carry no text.
pub fn value_text(value: &Value) -> Option<String> {
    let mut parts = Vec::new();
    collect_text(value, &mut parts);
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn collect_text<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) | Value::Set(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_text(item, out);
            }
        }
        _ => {}
    }
}
