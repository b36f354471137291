//! Desktop notifications for high usage.
//!
//! An alert fires once when a provider's primary percentage reaches the
//! threshold and re-arms only after usage drops back below it. State is
//! kept per provider.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::provider::Provider;

/// Default high-usage threshold, in percent.
pub const DEFAULT_HIGH_USAGE_THRESHOLD: i64 = 90;

/// Alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Whether notifications are enabled.
    pub enabled: bool,
    /// Percentage at or above which an alert fires.
    pub threshold: i64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_HIGH_USAGE_THRESHOLD,
        }
    }
}

/// Result of offering a reading to the alerter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationResult {
    /// Notification was sent.
    Sent,
    /// Below the threshold. Re-arms the alert if it had fired.
    BelowThreshold,
    /// Already alerted for this crossing.
    AlreadyNotified,
    /// Notifications are disabled.
    Disabled,
    /// Failed to send notification.
    Failed(String),
}

impl NotificationResult {
    /// Returns true if the notification was sent.
    pub fn was_sent(&self) -> bool {
        matches!(self, NotificationResult::Sent)
    }

    /// Returns true if notifications are disabled.
    pub fn was_disabled(&self) -> bool {
        matches!(self, NotificationResult::Disabled)
    }
}

/// Fires one desktop notification per threshold crossing.
#[derive(Debug, Clone, Default)]
pub struct HighUsageAlerts {
    settings: Arc<RwLock<AlertSettings>>,
    notified: Arc<RwLock<HashSet<Provider>>>,
}

impl HighUsageAlerts {
    /// Creates an alerter with default settings.
    pub fn new() -> Self {
        Self::with_settings(AlertSettings::default())
    }

    /// Creates an alerter with the given settings.
    pub fn with_settings(settings: AlertSettings) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            notified: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Gets a copy of the current settings.
    pub fn settings(&self) -> AlertSettings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Sets whether notifications are enabled.
    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut settings) = self.settings.write() {
            settings.enabled = enabled;
        }
    }

    /// Replaces the settings. Alerts already fired stay fired.
    pub fn set_settings(&self, new_settings: AlertSettings) {
        if let Ok(mut settings) = self.settings.write() {
            *settings = new_settings;
        }
    }

    /// Returns true if an alert has fired for the provider and not re-armed.
    pub fn is_notified(&self, provider: Provider) -> bool {
        self.notified
            .read()
            .map(|n| n.contains(&provider))
            .unwrap_or(false)
    }

    /// Offers a primary percentage reading.
    pub fn observe(&self, provider: Provider, percentage: i64) -> NotificationResult {
        let settings = self.settings();

        if percentage < settings.threshold {
            if let Ok(mut notified) = self.notified.write() {
                notified.remove(&provider);
            }
            return NotificationResult::BelowThreshold;
        }

        if self.is_notified(provider) {
            return NotificationResult::AlreadyNotified;
        }

        if !settings.enabled {
            return NotificationResult::Disabled;
        }

        let result = self.send_notification(provider, percentage);
        if result.was_sent() {
            if let Ok(mut notified) = self.notified.write() {
                notified.insert(provider);
            }
            tracing::info!("High usage alert sent for {} at {}%", provider, percentage);
        } else if let NotificationResult::Failed(reason) = &result {
            tracing::warn!("High usage alert for {} failed: {}", provider, reason);
        }
        result
    }

    #[cfg(feature = "notifications")]
    fn send_notification(&self, provider: Provider, percentage: i64) -> NotificationResult {
        use notify_rust::Notification;

        match Notification::new()
            .summary("Quotabar - High Usage")
            .body(&format_body(provider, percentage))
            .appname("Quotabar")
            .timeout(notify_rust::Timeout::Milliseconds(5000))
            .show()
        {
            Ok(_) => NotificationResult::Sent,
            Err(e) => NotificationResult::Failed(e.to_string()),
        }
    }

    #[cfg(not(feature = "notifications"))]
    fn send_notification(&self, _provider: Provider, _percentage: i64) -> NotificationResult {
        NotificationResult::Sent
    }
}

fn format_body(provider: Provider, percentage: i64) -> String {
    format!(
        "{} usage is at {}%. You may hit your limit soon.",
        provider.display_name(),
        percentage
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled() -> HighUsageAlerts {
        HighUsageAlerts::with_settings(AlertSettings {
            enabled: false,
            threshold: 90,
        })
    }

    #[test]
    fn default_settings() {
        let settings = AlertSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.threshold, 90);
    }

    #[test]
    fn below_threshold() {
        let alerts = HighUsageAlerts::new();
        assert_eq!(alerts.observe(Provider::Claude, 89), NotificationResult::BelowThreshold);
        assert!(!alerts.is_notified(Provider::Claude));
    }

    #[test]
    fn disabled_never_sends() {
        let alerts = disabled();
        let result = alerts.observe(Provider::Claude, 95);
        assert!(result.was_disabled());
        assert!(!alerts.is_notified(Provider::Claude));
    }

    #[test]
    fn rearms_after_drop() {
        let alerts = disabled();
        alerts
            .notified
            .write()
            .unwrap()
            .insert(Provider::Codex);

        assert_eq!(alerts.observe(Provider::Codex, 97), NotificationResult::AlreadyNotified);
        assert_eq!(alerts.observe(Provider::Codex, 40), NotificationResult::BelowThreshold);
        assert!(!alerts.is_notified(Provider::Codex));
    }

    #[test]
    fn state_is_per_provider() {
        let alerts = disabled();
        alerts.notified.write().unwrap().insert(Provider::ZAi);
        assert!(alerts.is_notified(Provider::ZAi));
        assert!(!alerts.is_notified(Provider::Claude));
    }

    #[test]
    fn set_enabled() {
        let alerts = HighUsageAlerts::new();
        alerts.set_enabled(false);
        assert!(!alerts.settings().enabled);
    }

    #[test]
    fn set_settings_moves_threshold() {
        let alerts = disabled();
        alerts.set_settings(AlertSettings {
            enabled: false,
            threshold: 50,
        });
        assert_eq!(alerts.settings().threshold, 50);
        assert!(alerts.observe(Provider::ZAi, 60).was_disabled());
    }

    #[test]
    fn body_mentions_provider() {
        let body = format_body(Provider::Claude, 93);
        assert!(body.contains("93%"));
        assert!(body.contains(Provider::Claude.display_name()));
    }

    #[cfg(not(feature = "notifications"))]
    #[test]
    fn sends_once_per_crossing() {
        let alerts = HighUsageAlerts::new();
        assert!(alerts.observe(Provider::Claude, 90).was_sent());
        assert_eq!(alerts.observe(Provider::Claude, 99), NotificationResult::AlreadyNotified);
        assert_eq!(alerts.observe(Provider::Claude, 10), NotificationResult::BelowThreshold);
        assert!(alerts.observe(Provider::Claude, 91).was_sent());
    }
}
