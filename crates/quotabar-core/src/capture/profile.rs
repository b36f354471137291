//! Per-provider capture heuristics.
//!
//! Each provider gets an immutable [`CaptureProfile`] describing where to
//! send the user, when scoring may begin, which URLs are worth reading,
//! and how to score what comes back. The point values are empirically
//! tuned defaults and can be overridden per profile.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::Provider;

/// Score at or above which a single response completes capture.
pub const DEFAULT_ACCEPT_THRESHOLD: u32 = 35;

/// Delay before the best below-threshold candidate is accepted.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(5);

static STATIC_ASSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(js|css|png|svg|jpg|woff2?|ico|json)$").unwrap());

/// Something observable about a `(url, body)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Signal {
    /// URL contains the substring.
    UrlContains(String),
    /// URL contains every substring.
    UrlContainsAll(Vec<String>),
    /// Body contains the substring.
    BodyContains(String),
    /// Body contains at least one substring.
    BodyContainsAny(Vec<String>),
}

impl Signal {
    /// Returns true if the signal is present.
    pub fn matches(&self, url: &str, body: &str) -> bool {
        match self {
            Signal::UrlContains(s) => url.contains(s.as_str()),
            Signal::UrlContainsAll(all) => all.iter().all(|s| url.contains(s.as_str())),
            Signal::BodyContains(s) => body.contains(s.as_str()),
            Signal::BodyContainsAny(any) => any.iter().any(|s| body.contains(s.as_str())),
        }
    }
}

/// Points awarded when a signal is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRule {
    /// The signal to look for.
    pub signal: Signal,
    /// Points added when it matches.
    pub points: u32,
}

impl ScoreRule {
    /// Creates a rule.
    pub fn new(signal: Signal, points: u32) -> Self {
        Self { signal, points }
    }
}

fn url(s: &str) -> Signal {
    Signal::UrlContains(s.to_string())
}

fn body(s: &str) -> Signal {
    Signal::BodyContains(s.to_string())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Capture heuristics for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureProfile {
    /// Provider this profile captures.
    pub provider: Provider,
    /// Where the login window starts.
    pub login_url: String,
    /// Navigating to a URL containing this enables scoring. `None` scores from the start.
    pub usage_page_marker: Option<String>,
    /// A candidate URL contains at least one of these.
    pub include: Vec<String>,
    /// A candidate URL contains none of these.
    pub exclude: Vec<String>,
    /// Reject URLs whose path ends in a static asset extension.
    pub exclude_static_assets: bool,
    /// Scoring rubric.
    pub rubric: Vec<ScoreRule>,
    /// Immediate-accept threshold.
    pub accept_threshold: u32,
    /// Delay before the best below-threshold candidate is accepted.
    pub fallback_delay: Duration,
}

impl CaptureProfile {
    /// Returns the built-in profile, or `None` for providers that do not use capture.
    pub fn for_provider(provider: Provider) -> Option<Self> {
        match provider {
            Provider::ZAi => Some(Self::z_ai()),
            Provider::Claude => Some(Self::claude()),
            Provider::Codex => Some(Self::codex()),
            Provider::Antigravity => None,
        }
    }

    fn base(provider: Provider, login_url: &str) -> Self {
        Self {
            provider,
            login_url: login_url.to_string(),
            usage_page_marker: None,
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_static_assets: false,
            rubric: Vec::new(),
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
        }
    }

    fn z_ai() -> Self {
        Self {
            usage_page_marker: Some("z.ai/manage-apikey/subscription".to_string()),
            include: strings(&["/api/biz/subscription/list", "/usage"]),
            rubric: vec![
                ScoreRule::new(
                    Signal::BodyContainsAny(strings(&["percent", "quota", "limit"])),
                    10,
                ),
                ScoreRule::new(url("/api/biz/subscription/list"), 25),
                ScoreRule::new(url("/usage"), 10),
            ],
            ..Self::base(Provider::ZAi, "https://z.ai/login")
        }
    }

    fn claude() -> Self {
        Self {
            usage_page_marker: Some("claude.ai/settings/usage".to_string()),
            include: strings(&["/usage", "/stats", "/api/organizations/"]),
            exclude: strings(&["statsig", "bootstrap", "_next/static"]),
            exclude_static_assets: true,
            rubric: vec![
                ScoreRule::new(body("percent_used"), 10),
                ScoreRule::new(body("resets_at"), 10),
                ScoreRule::new(body("utilization"), 5),
                ScoreRule::new(body("limits"), 5),
                ScoreRule::new(
                    Signal::UrlContainsAll(strings(&["/api/organizations/", "/usage"])),
                    25,
                ),
                ScoreRule::new(url("/account/usage"), 15),
            ],
            ..Self::base(Provider::Claude, "https://claude.ai/login")
        }
    }

    fn codex() -> Self {
        Self {
            include: strings(&["/backend-api/wham/usage", "/codex/settings/usage"]),
            exclude: strings(&["_next/static"]),
            exclude_static_assets: true,
            rubric: vec![
                ScoreRule::new(url("/backend-api/wham/usage"), 35),
                ScoreRule::new(body("rate_limit"), 10),
                ScoreRule::new(body("used_percent"), 10),
                ScoreRule::new(body("remaining"), 5),
            ],
            ..Self::base(Provider::Codex, "https://chatgpt.com/codex/settings/usage")
        }
    }

    /// Overrides the immediate-accept threshold.
    pub fn with_accept_threshold(mut self, threshold: u32) -> Self {
        self.accept_threshold = threshold;
        self
    }

    /// Overrides the fallback delay.
    pub fn with_fallback_delay(mut self, delay: Duration) -> Self {
        self.fallback_delay = delay;
        self
    }

    /// Returns true if scoring waits for the usage page.
    pub fn is_gated(&self) -> bool {
        self.usage_page_marker.is_some()
    }

    /// Returns true if navigating to `url` means the usage page was reached.
    pub fn is_usage_page(&self, url: &str) -> bool {
        self.usage_page_marker
            .as_deref()
            .is_some_and(|marker| url.contains(marker))
    }

    /// Returns true if a response from `url` should be read and scored.
    pub fn is_candidate(&self, url: &str) -> bool {
        if !self.include.iter().any(|s| url.contains(s.as_str())) {
            return false;
        }
        if self.exclude.iter().any(|s| url.contains(s.as_str())) {
            return false;
        }
        !(self.exclude_static_assets && STATIC_ASSET.is_match(url_path(url)))
    }

    /// Tallies the rubric for a response.
    pub fn score(&self, url: &str, body: &str) -> u32 {
        self.rubric
            .iter()
            .filter(|rule| rule.signal.matches(url, body))
            .map(|rule| rule.points)
            .sum()
    }
}

/// URL without query string or fragment.
fn url_path(url: &str) -> &str {
    let end = url.find(|c| c == '?' || c == '#').unwrap_or(url.len());
    &url[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn antigravity_has_no_profile() {
        assert!(CaptureProfile::for_provider(Provider::Antigravity).is_none());
        for provider in [Provider::ZAi, Provider::Claude, Provider::Codex] {
            let profile = CaptureProfile::for_provider(provider).unwrap();
            assert_eq!(profile.provider, provider);
            assert_eq!(profile.accept_threshold, 35);
            assert_eq!(profile.fallback_delay, Duration::from_secs(5));
        }
    }

    #[test]
    fn only_codex_is_ungated() {
        assert!(CaptureProfile::claude().is_gated());
        assert!(CaptureProfile::z_ai().is_gated());
        assert!(!CaptureProfile::codex().is_gated());
    }

    #[test]
    fn usage_page_marker() {
        let profile = CaptureProfile::claude();
        assert!(profile.is_usage_page("https://claude.ai/settings/usage"));
        assert!(!profile.is_usage_page("https://claude.ai/new"));
        assert!(!CaptureProfile::codex().is_usage_page("https://chatgpt.com/codex/settings/usage"));
    }

    #[test]
    fn claude_candidate_filter() {
        let profile = CaptureProfile::claude();
        assert!(profile.is_candidate("https://claude.ai/api/organizations/abc/usage"));
        assert!(profile.is_candidate("https://claude.ai/api/organizations/abc/stats?x=1"));
        assert!(!profile.is_candidate("https://claude.ai/api/bootstrap/abc/usage"));
        assert!(!profile.is_candidate("https://statsig.anthropic.com/v1/usage"));
        assert!(!profile.is_candidate("https://claude.ai/_next/static/chunks/usage.js"));
        assert!(!profile.is_candidate("https://claude.ai/api/organizations/abc/usage.json?v=2"));
        assert!(!profile.is_candidate("https://claude.ai/api/account"));
    }

    #[test]
    fn claude_rubric() {
        let profile = CaptureProfile::claude();
        let body = r#"{"five_hour":{"utilization":3,"resets_at":"x"},"percent_used":1}"#;
        assert_eq!(
            profile.score("https://claude.ai/api/organizations/abc/usage", body),
            50
        );
        assert_eq!(profile.score("https://claude.ai/api/organizations/abc/stats", "{}"), 0);
        assert_eq!(profile.score("https://claude.ai/account/usage", "limits"), 20);
    }

    #[test]
    fn z_ai_rubric() {
        let profile = CaptureProfile::z_ai();
        let url = "https://api.z.ai/api/biz/subscription/list";
        assert!(profile.is_candidate(url));
        assert_eq!(profile.score(url, r#"{"quota": 1}"#), 35);
        assert_eq!(profile.score("https://api.z.ai/api/monitor/usage/quota/limit", "{}"), 10);
    }

    #[test]
    fn codex_api_is_immediate() {
        let profile = CaptureProfile::codex();
        let url = "https://chatgpt.com/backend-api/wham/usage";
        assert!(profile.is_candidate(url));
        assert!(profile.score(url, "{}") >= profile.accept_threshold);
    }

    #[test]
    fn overrides() {
        let profile = CaptureProfile::claude()
            .with_accept_threshold(50)
            .with_fallback_delay(Duration::from_secs(1));
        assert_eq!(profile.accept_threshold, 50);
        assert_eq!(profile.fallback_delay, Duration::from_secs(1));
    }

    #[test]
    fn signal_matching() {
        let all = Signal::UrlContainsAll(strings(&["/a/", "/b"]));
        assert!(all.matches("https://x/a/1/b", ""));
        assert!(!all.matches("https://x/a/1", ""));
        let any = Signal::BodyContainsAny(strings(&["x", "y"]));
        assert!(any.matches("", "..y.."));
        assert!(!any.matches("", "zzz"));
    }
}
