//! Recursive-descent walk over a parsed JSON document.
//!
//! The walker carries the depth and the chain of ancestor keys as plain
//! parameters and emits raw matches. It never looks at values beyond
//! simple kind checks and key-name patterns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::classify::classify_label;
use crate::metric::labels;

/// Nodes deeper than this are not inspected.
pub(crate) const MAX_DEPTH: usize = 5;

static PERCENT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)percent|percentage|usage_percent|utilization").unwrap());
static RESET_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)reset").unwrap());
static USED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)used|usage").unwrap());
static LIMIT_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)limit|quota|total").unwrap());

const TIME_LIMIT_TYPE: &str = "TIME_LIMIT";
const TOKENS_LIMIT_TYPE: &str = "TOKENS_LIMIT";

/// Where a match's percentage came from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MatchSource {
    /// A node with an explicit window discriminator.
    Explicit,
    /// A percent-like key on the node.
    PercentKey(String),
    /// Computed as used / limit.
    Ratio,
}

/// A candidate usage figure before reset bucketing and aggregation.
#[derive(Debug, Clone)]
pub(crate) struct RawMatch {
    pub label: String,
    pub value: f64,
    pub reset: Option<Value>,
    pub used: Option<Value>,
    pub limit: Option<Value>,
    pub source: MatchSource,
}

impl RawMatch {
    /// Returns true if the source key reports fractions (0.42 meaning 42%).
    pub(crate) fn is_fractional(&self) -> bool {
        matches!(&self.source, MatchSource::PercentKey(key) if key.eq_ignore_ascii_case("percent_used"))
    }
}

/// Collects every usage match in document order.
pub(crate) fn collect_matches(root: &Value) -> Vec<RawMatch> {
    let mut matches = Vec::new();
    let mut ancestors = Vec::new();
    walk(root, 0, &mut ancestors, &mut matches);
    matches
}

fn walk<'a>(node: &'a Value, depth: usize, ancestors: &mut Vec<&'a str>, out: &mut Vec<RawMatch>) {
    if depth > MAX_DEPTH {
        return;
    }

    match node {
        Value::Array(items) => {
            if ancestors.last().copied() == Some("limits") {
                out.extend(items.iter().filter_map(explicit_match));
            }
            for item in items {
                walk(item, depth + 1, ancestors, out);
            }
        }
        Value::Object(map) => {
            if let Some(found) = explicit_match(node) {
                out.push(found);
                return;
            }

            if let Some(found) = key_match(map, ancestors) {
                out.push(found);
            }

            for (key, child) in map {
                ancestors.push(key.as_str());
                walk(child, depth + 1, ancestors, out);
                ancestors.pop();
            }
        }
        _ => {}
    }
}

/// Match for a node carrying a `type` window discriminator.
fn explicit_match(node: &Value) -> Option<RawMatch> {
    let map = node.as_object()?;
    let label = match map.get("type").and_then(Value::as_str)? {
        TIME_LIMIT_TYPE => labels::FIVE_HOUR,
        TOKENS_LIMIT_TYPE => labels::TOKEN_USAGE,
        _ => return None,
    };

    let value = map.get("percentage").and_then(coerce_number).unwrap_or(0.0);
    let reset = [map.get("nextResetTime"), map.get("resetTime")]
        .into_iter()
        .flatten()
        .find(|v| is_truthy(v))
        .cloned();

    Some(RawMatch {
        label: label.to_string(),
        value,
        reset,
        used: map.get("currentValue").and_then(passthrough),
        limit: map.get("usage").and_then(passthrough),
        source: MatchSource::Explicit,
    })
}

/// Generic percent-key match, falling back to a used/limit ratio.
fn key_match(map: &Map<String, Value>, ancestors: &[&str]) -> Option<RawMatch> {
    let find = |re: &Regex| map.keys().find(|k| re.is_match(k));
    let reset = find(&RESET_KEY).and_then(|k| map.get(k)).cloned();
    let limit_key = find(&LIMIT_KEY);

    if let Some(percent_key) = find(&PERCENT_KEY) {
        let value = coerce_percent(&map[percent_key])?;
        let used_key = map
            .keys()
            .find(|k| USED_KEY.is_match(k) && *k != percent_key);

        return Some(RawMatch {
            label: classify_label(percent_key, ancestors),
            value,
            reset,
            used: used_key.and_then(|k| passthrough(&map[k])),
            limit: limit_key.and_then(|k| passthrough(&map[k])),
            source: MatchSource::PercentKey(percent_key.clone()),
        });
    }

    let used_key = find(&USED_KEY)?;
    let limit_key = limit_key?;
    let used = coerce_number(&map[used_key])?;
    let limit = coerce_number(&map[limit_key])?;
    if limit <= 0.0 {
        return None;
    }

    Some(RawMatch {
        label: classify_label(used_key, ancestors),
        value: used / limit * 100.0,
        reset,
        used: passthrough(&map[used_key]),
        limit: passthrough(&map[limit_key]),
        source: MatchSource::Ratio,
    })
}

/// Reads a percent value, accepting strings such as `"42.5%"`.
fn coerce_percent(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => leading_number(&s.replacen('%', "", 1)),
        _ => None,
    }
}

/// Numeric coercion for ratio inputs.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Parses the longest leading decimal number in `s`.
fn leading_number(s: &str) -> Option<f64> {
    static LEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-+]?(\d+\.?\d*|\.\d+)").unwrap());
    LEADING
        .find(s)
        .and_then(|m| m.as_str().trim().parse::<f64>().ok())
}

/// Only scalar values are carried through for display.
fn passthrough(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) | Value::String(_) => Some(value.clone()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
