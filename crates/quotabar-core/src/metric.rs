//! Normalized usage metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known metric labels.
pub mod labels {
    /// Short rolling window (five hours).
    pub const FIVE_HOUR: &str = "5-Hour Window";
    /// Seven-day window.
    pub const WEEKLY: &str = "Weekly Limit";
    /// Thirty-day window.
    pub const MONTHLY: &str = "Monthly Limit";
    /// Generic token or billing quota.
    pub const TOKEN_USAGE: &str = "Token Usage";
    /// Code review allowance.
    pub const CODE_REVIEW: &str = "Code Review";
    /// Web search quota.
    pub const SEARCH_USAGE: &str = "Search Usage";
    /// MCP tool-call quota.
    pub const MCP_USAGE: &str = "MCP Usage";
}

/// Shown in place of a reset countdown when no future reset is known.
pub const RESET_UNAVAILABLE: &str = "Unavailable";

/// Window length assumed for a five-hour bucket, in minutes.
pub const FIVE_HOUR_MINUTES: i64 = 300;
/// Window length of a weekly bucket, in minutes.
pub const WEEKLY_MINUTES: i64 = 10_080;
/// Window length of a monthly bucket, in minutes.
pub const MONTHLY_MINUTES: i64 = 43_200;

/// One normalized usage figure for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetric {
    /// Semantic bucket name.
    pub label: String,
    /// Percentage consumed. Not clamped.
    pub percentage: i64,
    /// Raw "used" value from the source document, for display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<Value>,
    /// Raw "limit" value from the source document, for display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
    /// When the quota window resets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Minutes until reset, only when the reset is in the future.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_remaining: Option<i64>,
    /// Total window length in minutes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_total_minutes: Option<i64>,
    /// Human countdown or [`RESET_UNAVAILABLE`].
    pub display_reset: String,
}

impl UsageMetric {
    /// Creates a metric with no reset information.
    pub fn new(label: impl Into<String>, percentage: i64) -> Self {
        Self {
            label: label.into(),
            percentage,
            used: None,
            limit: None,
            reset_at: None,
            minutes_remaining: None,
            window_total_minutes: None,
            display_reset: RESET_UNAVAILABLE.to_string(),
        }
    }

    /// Attaches a reset time, deriving the countdown relative to `now`.
    pub fn with_reset(mut self, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        self.reset_at = reset_at;
        self.minutes_remaining = None;
        self.display_reset = RESET_UNAVAILABLE.to_string();

        if let Some(reset) = reset_at {
            if reset > now {
                let millis = (reset - now).num_milliseconds();
                let minutes = (millis as f64 / 60_000.0).round() as i64;
                self.minutes_remaining = Some(minutes);
                self.display_reset = format_reset(minutes);
            }
        }
        self
    }

    /// Sets the total window length.
    pub fn with_window(mut self, minutes: Option<i64>) -> Self {
        self.window_total_minutes = minutes;
        self
    }

    /// Sets the raw used/limit passthrough values.
    pub fn with_used_limit(mut self, used: Option<Value>, limit: Option<Value>) -> Self {
        self.used = used;
        self.limit = limit;
        self
    }

    /// Returns true if a countdown could be computed for this metric.
    pub fn has_resolvable_reset(&self) -> bool {
        self.display_reset != RESET_UNAVAILABLE
    }

    /// Returns true for the five-hour window bucket.
    pub fn is_five_hour(&self) -> bool {
        self.label == labels::FIVE_HOUR
    }
}

/// Output of one extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    /// Percentage chosen to represent the provider overall.
    pub primary_percentage: Option<i64>,
    /// Aggregated metrics in display order.
    pub metrics: Vec<UsageMetric>,
}

impl ExtractionResult {
    /// The empty result returned on total failure.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing was extracted.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Looks up a metric by label.
    pub fn metric(&self, label: &str) -> Option<&UsageMetric> {
        self.metrics.iter().find(|m| m.label == label)
    }
}

/// Formats a countdown in minutes for display.
///
/// ```
/// use quotabar_core::format_reset;
///
/// assert_eq!(format_reset(0), "Resetting soon");
/// assert_eq!(format_reset(95), "1h 35m");
/// assert_eq!(format_reset(3000), "2d 2h");
/// ```
pub fn format_reset(minutes: i64) -> String {
    if minutes <= 0 {
        return "Resetting soon".to_string();
    }

    if minutes >= 1440 {
        let days = minutes / 1440;
        let hours = (minutes % 1440) / 60;
        return format!("{}d {}h", days, hours);
    }

    let hours = minutes / 60;
    let mins = minutes % 60;
    match (hours, mins) {
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}

/// Severity of a usage percentage relative to configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    /// Below the warning threshold.
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

impl UsageLevel {
    /// Classifies a percentage.
    pub fn from_percentage(percentage: i64, warning: i64, critical: i64) -> Self {
        if percentage >= critical {
            UsageLevel::Critical
        } else if percentage >= warning {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    /// Returns the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageLevel::Normal => "normal",
            UsageLevel::Warning => "warning",
            UsageLevel::Critical => "critical",
        }
    }
}
