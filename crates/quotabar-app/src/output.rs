//! Plain-text rendering for the command line.

use quotabar_core::{Provider, UsageMetric};
use quotabar_storage::{CredentialSummary, DailyPeak};

use crate::poller::{PollOutcome, ProviderReport};

/// Renders one provider's poll result, metrics indented below the headline.
pub fn format_report(report: &ProviderReport) -> String {
    let name = report.provider.display_name();
    match &report.outcome {
        PollOutcome::Usage(result) => {
            let headline = match (result.primary_percentage, report.level) {
                (Some(pct), Some(level)) => format!("{:<14} {:>4}%  {}", name, pct, level.as_str()),
                (Some(pct), None) => format!("{:<14} {:>4}%", name, pct),
                _ => format!("{:<14}    -   no usage found", name),
            };
            let mut lines = vec![headline];
            lines.extend(result.metrics.iter().map(format_metric));
            lines.join("\n")
        }
        PollOutcome::NotConfigured => format!("{:<14}    -   not connected", name),
        PollOutcome::NotConnected(reason) => format!("{:<14}    -   not running ({})", name, reason),
        PollOutcome::Failed(reason) => format!("{:<14}    -   {}", name, reason),
    }
}

/// Renders a metric line: label, percentage, and reset countdown.
pub fn format_metric(metric: &UsageMetric) -> String {
    let mut line = format!(
        "    {:<18} {:>4}%  resets: {}",
        metric.label, metric.percentage, metric.display_reset
    );
    if let (Some(used), Some(limit)) = (&metric.used, &metric.limit) {
        line.push_str(&format!("  ({} / {})", used, limit));
    }
    line
}

/// Renders daily peaks as a simple bar chart.
pub fn format_peaks(provider: Provider, peaks: &[DailyPeak]) -> String {
    if peaks.is_empty() {
        return format!("No history for {}", provider.display_name());
    }

    let mut lines = vec![format!("{} daily peaks", provider.display_name())];
    for peak in peaks {
        let width = (peak.percentage.clamp(0, 100) / 5) as usize;
        lines.push(format!(
            "{}  {:>4}%  {}",
            peak.date.format("%Y-%m-%d"),
            peak.percentage,
            "#".repeat(width)
        ));
    }
    lines.join("\n")
}

/// Renders whether each capture provider has a stored credential.
pub fn format_credentials(credentials: &[CredentialSummary]) -> Vec<String> {
    Provider::all()
        .iter()
        .filter(|p| p.uses_capture())
        .map(|provider| {
            match credentials.iter().find(|c| c.provider == *provider) {
                Some(c) => format!(
                    "{:<14} connected  {}  (captured {})",
                    provider.display_name(),
                    c.url,
                    c.updated_at.format("%Y-%m-%d %H:%M UTC")
                ),
                None => format!("{:<14} not connected", provider.display_name()),
            }
        })
        .collect()
}
