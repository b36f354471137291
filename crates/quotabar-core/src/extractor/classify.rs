//! Label classification from key names.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::metric::labels;

static FIVE_HOUR_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)session|five_hour|quota|time_limit").unwrap());
static WEEKLY_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)week|weekly|7.day|seven.day").unwrap());
static SEARCH_CONTEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)search|web|zread|mcp").unwrap());
static TOKEN_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)token|billing|monthly|tokens_limit").unwrap());
static MCP_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)mcp").unwrap());
static SEARCH_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)search|web").unwrap());

/// Classifies the matching key of a node given its ancestor keys.
///
/// The joined ancestor path and the immediate parent are both consulted.
/// Weekly and search patterns also look at the key itself.
pub(crate) fn classify_label(key: &str, ancestors: &[&str]) -> String {
    let context = ancestors.join("_").to_lowercase();
    let parent = ancestors.last().map(|p| p.to_lowercase()).unwrap_or_default();

    let in_context = |re: &Regex| re.is_match(&context) || re.is_match(&parent);

    if in_context(&FIVE_HOUR_CONTEXT) {
        return labels::FIVE_HOUR.to_string();
    }

    if WEEKLY_CONTEXT.is_match(key) || in_context(&WEEKLY_CONTEXT) {
        return labels::WEEKLY.to_string();
    }

    if SEARCH_CONTEXT.is_match(key) || in_context(&SEARCH_CONTEXT) {
        if MCP_KEY.is_match(key) {
            return labels::MCP_USAGE.to_string();
        }
        if SEARCH_KEY.is_match(key) {
            return labels::SEARCH_USAGE.to_string();
        }
        return derive_label(key);
    }

    if in_context(&TOKEN_CONTEXT) {
        return labels::TOKEN_USAGE.to_string();
    }

    derive_label(key)
}

/// Renders a key name as a title-cased label.
///
/// Underscores and camel-case boundaries become spaces.
pub(crate) fn derive_label(key: &str) -> String {
    let mut spaced = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;

    for ch in key.chars() {
        if ch == '_' || ch == '-' {
            spaced.push(' ');
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            spaced.push(' ');
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        spaced.push(ch);
    }

    spaced
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Display priority group for sorting.
pub(crate) fn priority_group(label: &str) -> u8 {
    static WEEKLY_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)week|weekly|7.day").unwrap());

    if label == labels::FIVE_HOUR {
        0
    } else if WEEKLY_LABEL.is_match(label) {
        1
    } else if SEARCH_CONTEXT.is_match(label) {
        2
    } else {
        3
    }
}
