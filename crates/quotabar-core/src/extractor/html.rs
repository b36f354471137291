//! Markup scanning for usage pages that render limits as HTML cards.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::metric::{labels, UsageMetric, FIVE_HOUR_MINUTES, WEEKLY_MINUTES};

static BLOCK_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<article\b").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)>").unwrap());
static REMAINING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*%\s*remaining").unwrap());
static RESETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)resets\s+(?:on\s+)?([a-z]{3,9}\.?\s+\d{1,2},?\s+\d{4}(?:,?\s+(?:at\s+)?\d{1,2}:\d{2}\s*[ap]m)?)",
    )
    .unwrap()
});

/// Card titles and the bucket each one maps to.
const KNOWN_BLOCKS: &[(&str, &str, Option<i64>)] = &[
    ("5 hour usage limit", labels::FIVE_HOUR, Some(FIVE_HOUR_MINUTES)),
    ("weekly usage limit", labels::WEEKLY, Some(WEEKLY_MINUTES)),
    ("code review", labels::CODE_REVIEW, None),
];

/// Returns true if the body is markup rather than a JSON document.
pub(crate) fn looks_like_markup(body: &str) -> bool {
    body.trim_start().starts_with('<')
}

/// Scans each usage card and emits one metric per recognized card.
pub(crate) fn scan_blocks(body: &str, now: DateTime<Utc>) -> Vec<UsageMetric> {
    let body = SCRIPT.replace_all(body, " ");
    let starts: Vec<usize> = BLOCK_START.find_iter(&body).map(|m| m.start()).collect();

    let blocks: Vec<&str> = if starts.is_empty() {
        vec![&body[..]]
    } else {
        starts
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = starts.get(i + 1).copied().unwrap_or(body.len());
                &body[start..end]
            })
            .collect()
    };

    blocks
        .into_iter()
        .filter_map(|block| scan_block(block, now))
        .collect()
}

fn scan_block(block: &str, now: DateTime<Utc>) -> Option<UsageMetric> {
    let text = visible_text(block);
    let lower = text.to_lowercase();

    let (_, label, window) = KNOWN_BLOCKS
        .iter()
        .find(|(needle, _, _)| lower.contains(needle))?;

    let remaining: f64 = REMAINING.captures(&text)?.get(1)?.as_str().parse().ok()?;
    let reset = RESETS
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_reset_text(m.as_str()));

    Some(
        UsageMetric::new(*label, (100.0 - remaining).round() as i64)
            .with_reset(reset, now)
            .with_window(*window),
    )
}

/// Strips tags and collapses whitespace.
fn visible_text(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses reset phrases like `Jan 30, 2026 9:41 AM`, read as UTC.
fn parse_reset_text(s: &str) -> Option<DateTime<Utc>> {
    let cleaned = s.replace('.', "").replace(" at ", " ").replace(',', "");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    for fmt in ["%b %d %Y %I:%M %p", "%B %d %Y %I:%M %p"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in ["%b %d %Y", "%B %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 23, 12, 0, 0).unwrap()
    }

    const PAGE: &str = r#"<!doctype html><html><body>
        <script>var x = "<article>99% remaining</article>";</script>
        <article class="card"><h3>5 hour usage limit</h3><p><span>72%</span> remaining</p>
            <p>Resets Jan 23, 2026 3:30 PM</p></article>
        <article class="card"><h3>Weekly usage limit</h3><p>40% remaining</p>
            <p>Resets Jan 28, 2026</p></article>
        <article class="card"><h3>Code review</h3><p>100% remaining</p></article>
        <article class="card"><h3>Credits</h3><p>12% remaining</p></article>
    </body></html>"#;

    #[test]
    fn detects_markup() {
        assert!(looks_like_markup("  <!doctype html>"));
        assert!(!looks_like_markup("{\"a\":1}"));
    }

    #[test]
    fn scans_known_cards() {
        let metrics = scan_blocks(PAGE, now());
        assert_eq!(metrics.len(), 3);

        assert_eq!(metrics[0].label, labels::FIVE_HOUR);
        assert_eq!(metrics[0].percentage, 28);
        assert_eq!(metrics[0].minutes_remaining, Some(210));
        assert_eq!(metrics[0].window_total_minutes, Some(FIVE_HOUR_MINUTES));

        assert_eq!(metrics[1].label, labels::WEEKLY);
        assert_eq!(metrics[1].percentage, 60);
        assert!(metrics[1].has_resolvable_reset());

        assert_eq!(metrics[2].label, labels::CODE_REVIEW);
        assert_eq!(metrics[2].percentage, 0);
    }

    #[test]
    fn document_without_cards_is_one_block() {
        let metrics = scan_blocks("<div>Weekly usage limit: 10% remaining</div>", now());
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].percentage, 90);
    }

    #[test]
    fn unrecognized_card_is_dropped() {
        let metrics = scan_blocks("<article>Credits 5% remaining</article>", now());
        assert!(metrics.is_empty());
    }

    #[test]
    fn reset_text_formats() {
        assert!(parse_reset_text("Jan 23, 2026 3:30 PM").is_some());
        assert!(parse_reset_text("January 23, 2026 at 3:30 PM").is_some());
        assert!(parse_reset_text("Jan. 23, 2026").is_some());
        assert!(parse_reset_text("tomorrow").is_none());
    }
}
