//! Frequency-based keyword extraction and the word-count helper used by the
//! summarizer actions.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

const TRIM_CHARS: &[char] = &[
    '.', ',', ';', ':', '!', '?', '(', ')', '[', ']', '{', '}', '"', '\'',
];

/// Top-N keywords by frequency. Markdown metacharacters are blanked before
/// tokenizing; ties keep first-encounter order.
pub fn extract_keywords(content: &str, top_n: usize, min_word_length: usize) -> Vec<String> {
    if top_n == 0 {
        return Vec::new();
    }
    let min_word_length = min_word_length.max(1);
    let cleaned = blank_markdown(&content.to_lowercase(), false);

    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for token in cleaned.split_whitespace() {
        let word = token.trim_matches(TRIM_CHARS);
        if word.is_empty() || word.chars().count() < min_word_length {
            continue;
        }
        if STOP_WORDS.contains(&word) {
            continue;
        }
        match positions.get(word) {
            Some(&idx) => counts[idx].1 += 1,
            None => {
                positions.insert(word.to_string(), counts.len());
                counts.push((word.to_string(), 1));
            }
        }
    }

    // sort_by is stable, so equal counts keep encounter order.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(top_n).map(|(w, _)| w).collect()
}

/// Count the words of a markdown document. Link/image brackets are stripped
/// in addition to the inline markup characters.
pub fn word_count(content: &str) -> usize {
    blank_markdown(&content.to_lowercase(), true)
        .split_whitespace()
        .filter(|token| !token.trim_matches(TRIM_CHARS).is_empty())
        .count()
}

fn blank_markdown(content: &str, strip_brackets: bool) -> String {
    content
        .chars()
        .map(|c| match c {
            '#' | '*' | '_' | '`' => ' ',
            '[' | ']' | '(' | ')' if strip_brackets => ' ',
            _ => c,
        })
        .collect()
}

/// Limit a string to `limit` characters without splitting a code point.
/// Returns the clamped slice and whether anything was cut off.
pub fn truncate_chars(s: &str, limit: usize) -> (&str, bool) {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}
