//! Data models for storage.

use chrono::{DateTime, NaiveDate, Utc};
use quotabar_core::Provider;
use serde::{Deserialize, Serialize};

/// A configuration key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration key.
    pub key: String,
    /// Configuration value (JSON).
    pub value: serde_json::Value,
}

/// Summary of a stored credential, without header values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    /// Provider the credential belongs to.
    pub provider: Provider,
    /// Usage endpoint URL.
    pub url: String,
    /// Number of stored headers.
    pub header_count: usize,
    /// When the credential was captured.
    pub updated_at: DateTime<Utc>,
}

/// One recorded primary percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Unique identifier.
    pub id: i64,
    /// Provider polled.
    pub provider: Provider,
    /// When the poll completed.
    pub recorded_at: DateTime<Utc>,
    /// Primary percentage.
    pub percentage: i64,
}

/// Highest recorded percentage on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPeak {
    /// The day.
    pub date: NaiveDate,
    /// Maximum percentage recorded that day.
    pub percentage: i64,
}
