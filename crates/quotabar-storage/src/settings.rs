//! Typed view over the `config` table.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageError};
use crate::repository::ConfigRepo;

/// Minutes between background polls.
pub const REFRESH_INTERVAL_MINUTES: &str = "refresh_interval_minutes";
/// Percentage at which the status level becomes a warning.
pub const WARNING_THRESHOLD: &str = "warning_threshold";
/// Percentage at which the status level becomes critical.
pub const CRITICAL_THRESHOLD: &str = "critical_threshold";
/// Percentage at which a desktop alert fires.
pub const HIGH_USAGE_THRESHOLD: &str = "high_usage_threshold";
/// Whether desktop alerts are shown.
pub const NOTIFICATIONS_ENABLED: &str = "notifications_enabled";
/// Browser executable used for login windows.
pub const BROWSER: &str = "browser";

/// Every recognized key.
pub const KEYS: &[&str] = &[
    REFRESH_INTERVAL_MINUTES,
    WARNING_THRESHOLD,
    CRITICAL_THRESHOLD,
    HIGH_USAGE_THRESHOLD,
    NOTIFICATIONS_ENABLED,
    BROWSER,
];

/// Application settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Minutes between background polls. At least 1.
    pub refresh_interval_minutes: u64,
    /// Warning level threshold, in percent.
    pub warning_threshold: i64,
    /// Critical level threshold, in percent.
    pub critical_threshold: i64,
    /// Desktop alert threshold, in percent.
    pub high_usage_threshold: i64,
    /// Whether desktop alerts are shown.
    pub notifications_enabled: bool,
    /// Browser executable override.
    pub browser: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: 15,
            warning_threshold: 50,
            critical_threshold: 80,
            high_usage_threshold: 90,
            notifications_enabled: true,
            browser: None,
        }
    }
}

impl Settings {
    /// Loads settings, using the default for anything missing or mistyped.
    pub fn load(conn: &Connection) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            refresh_interval_minutes: ConfigRepo::get_or_default(
                conn,
                REFRESH_INTERVAL_MINUTES,
                defaults.refresh_interval_minutes,
            )?
            .max(1),
            warning_threshold: ConfigRepo::get_or_default(
                conn,
                WARNING_THRESHOLD,
                defaults.warning_threshold,
            )?,
            critical_threshold: ConfigRepo::get_or_default(
                conn,
                CRITICAL_THRESHOLD,
                defaults.critical_threshold,
            )?,
            high_usage_threshold: ConfigRepo::get_or_default(
                conn,
                HIGH_USAGE_THRESHOLD,
                defaults.high_usage_threshold,
            )?,
            notifications_enabled: ConfigRepo::get_or_default(
                conn,
                NOTIFICATIONS_ENABLED,
                defaults.notifications_enabled,
            )?,
            browser: ConfigRepo::get_or_default(conn, BROWSER, defaults.browser)?,
        })
    }

    /// Converts command-line text into the stored JSON value for `key`.
    pub fn parse_value(key: &str, raw: &str) -> Result<Value> {
        let invalid = |reason: &str| StorageError::InvalidSetting {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let raw = raw.trim();

        match key {
            REFRESH_INTERVAL_MINUTES => {
                let minutes: u64 = raw.parse().map_err(|_| invalid("expected whole minutes"))?;
                if minutes == 0 {
                    return Err(invalid("must be at least 1"));
                }
                Ok(Value::from(minutes))
            }
            WARNING_THRESHOLD | CRITICAL_THRESHOLD | HIGH_USAGE_THRESHOLD => {
                let percent: i64 = raw.parse().map_err(|_| invalid("expected a percentage"))?;
                if !(0..=100).contains(&percent) {
                    return Err(invalid("must be between 0 and 100"));
                }
                Ok(Value::from(percent))
            }
            NOTIFICATIONS_ENABLED => match raw.to_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "off" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("expected true or false")),
            },
            BROWSER => {
                if raw.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::String(raw.to_string()))
                }
            }
            _ => Err(StorageError::UnknownSetting(key.to_string())),
        }
    }

    /// Parses `raw` for `key` and checks it against the other current
    /// settings. The critical threshold may not sit below the warning one.
    pub fn validate(&self, key: &str, raw: &str) -> Result<Value> {
        let value = Self::parse_value(key, raw)?;
        let (warning, critical) = match (key, value.as_i64()) {
            (WARNING_THRESHOLD, Some(v)) => (v, self.critical_threshold),
            (CRITICAL_THRESHOLD, Some(v)) => (self.warning_threshold, v),
            _ => return Ok(value),
        };

        if critical < warning {
            return Err(StorageError::InvalidSetting {
                key: key.to_string(),
                reason: format!(
                    "critical threshold {}% is below warning threshold {}%",
                    critical, warning
                ),
            });
        }
        Ok(value)
    }

    /// Returns true if `key` is a recognized setting.
    pub fn is_known(key: &str) -> bool {
        KEYS.contains(&key)
    }
}
