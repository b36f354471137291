//! Heuristic usage extraction.
//!
//! Turns an arbitrary response body into a normalized list of
//! [`UsageMetric`]s. Providers do not document these payloads and change
//! them without notice, so the engine works from key-name patterns and
//! value kinds rather than fixed schemas, and degrades to an empty result
//! instead of failing.
//!
//! ## Pipeline
//!
//! ```text
//! body ─► markup? (Codex only) ─► card scan ──────────────┐
//!   │                                                     │
//!   └─► JSON parse ─► walk (depth ≤ 5) ─► raw matches     │
//!          │                               │              │
//!          │ not a document                ▼              ▼
//!          ▼                      normalize + bucket ─► aggregate ─► sort ─► primary
//!     "N%" regex fallback
//! ```

mod classify;
mod html;
mod reset;
mod walker;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::metric::{labels, ExtractionResult, UsageMetric, FIVE_HOUR_MINUTES};
use crate::provider::Provider;

pub use reset::{parse_timestamp, parse_timestamp_str};

use classify::priority_group;
use reset::ResetBucket;
use walker::RawMatch;

/// Extracts usage from a response body using the current time.
pub fn extract(body: &str, hint: Provider) -> ExtractionResult {
    extract_at(body, hint, Utc::now())
}

/// Extracts usage from a response body relative to `now`.
///
/// Pure: the same inputs always give the same output.
pub fn extract_at(body: &str, hint: Provider, now: DateTime<Utc>) -> ExtractionResult {
    if hint == Provider::Codex && html::looks_like_markup(body) {
        let metrics = html::scan_blocks(body, now);
        tracing::debug!("Markup scan for {} found {} metrics", hint, metrics.len());
        return finalize(metrics);
    }

    let document: Value = match serde_json::from_str(body) {
        Ok(doc @ (Value::Object(_) | Value::Array(_))) => doc,
        _ => {
            tracing::debug!("Body for {} is not a JSON document, trying text fallback", hint);
            return text_fallback(body);
        }
    };

    let metrics: Vec<UsageMetric> = walker::collect_matches(&document)
        .into_iter()
        .map(|m| normalize(m, now))
        .collect();

    if metrics.is_empty() {
        tracing::debug!("No usage matches for {}", hint);
    }

    finalize(metrics)
}

/// Applies fraction normalization and reset bucketing to a raw match.
fn normalize(raw: RawMatch, now: DateTime<Utc>) -> UsageMetric {
    let mut value = raw.value;
    if raw.is_fractional() && value <= 1.0 {
        value *= 100.0;
    }

    let reset = raw.reset.as_ref().and_then(parse_timestamp);
    let mut label = raw.label;
    let mut window = None;

    if let Some((bucket_label, minutes)) = reset.and_then(|r| ResetBucket::for_reset(r, now).label()) {
        label = bucket_label.to_string();
        window = Some(minutes);
    }

    if window.is_none() && label == labels::FIVE_HOUR {
        window = Some(FIVE_HOUR_MINUTES);
    }

    UsageMetric::new(label, value.round() as i64)
        .with_reset(reset, now)
        .with_window(window)
        .with_used_limit(raw.used, raw.limit)
}

/// Collapses duplicates per label, sorts, and picks the primary percentage.
pub(crate) fn finalize(metrics: Vec<UsageMetric>) -> ExtractionResult {
    let mut metrics = aggregate(metrics);
    metrics.sort_by(|a, b| {
        priority_group(&a.label)
            .cmp(&priority_group(&b.label))
            .then(b.percentage.cmp(&a.percentage))
    });

    let primary = metrics
        .iter()
        .find(|m| m.is_five_hour())
        .or_else(|| metrics.iter().find(|m| m.has_resolvable_reset()))
        .or_else(|| metrics.first())
        .map(|m| m.percentage);

    ExtractionResult {
        primary_percentage: primary,
        metrics,
    }
}

/// Keeps one metric per label, preserving first-seen label order.
///
/// A later metric replaces the current one only if it has a valid reset
/// and the current does not, or if both agree on reset validity and the
/// later percentage is strictly greater.
fn aggregate(metrics: Vec<UsageMetric>) -> Vec<UsageMetric> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, UsageMetric> = HashMap::new();

    for metric in metrics {
        match best.get(&metric.label) {
            None => {
                order.push(metric.label.clone());
                best.insert(metric.label.clone(), metric);
            }
            Some(current) => {
                let new_valid = metric.has_resolvable_reset();
                let current_valid = current.has_resolvable_reset();
                let better = (new_valid && !current_valid)
                    || (new_valid == current_valid && metric.percentage > current.percentage);
                if better {
                    best.insert(metric.label.clone(), metric);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|label| best.remove(&label))
        .collect()
}

/// Last-resort scan of a body that is not a JSON document.
fn text_fallback(body: &str) -> ExtractionResult {
    static PERCENT_TOKEN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#""?(\d+(?:\.\d+)?)%"?"#).unwrap());

    let Some(value) = PERCENT_TOKEN
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    else {
        return ExtractionResult::empty();
    };

    let percentage = value.round() as i64;
    ExtractionResult {
        primary_percentage: Some(percentage),
        metrics: vec![
            UsageMetric::new(labels::TOKEN_USAGE, percentage),
            UsageMetric::new(labels::FIVE_HOUR, 0).with_window(Some(FIVE_HOUR_MINUTES)),
        ],
    }
}
