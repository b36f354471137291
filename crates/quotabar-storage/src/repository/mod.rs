//! Database repositories for each table.

pub mod config;
pub mod credentials;
pub mod history;

pub use config::ConfigRepo;
pub use credentials::CredentialsRepo;
pub use history::HistoryRepo;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp for storage. Fixed width so text comparison orders correctly.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a stored timestamp.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
