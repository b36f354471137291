//! Quotabar Storage - SQLite persistence layer.
//!
//! This crate stores everything Quotabar keeps between runs:
//!
//! - Captured endpoint credentials (cookie headers are never written)
//! - Primary-percentage history per provider
//! - Configuration key-value storage with a typed [`Settings`] view
//!
//! # Example
//!
//! ```no_run
//! use quotabar_core::Provider;
//! use quotabar_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.record_usage(Provider::Claude, chrono::Utc::now(), 42).unwrap();
//!
//! let settings = db.settings().unwrap();
//! assert_eq!(settings.refresh_interval_minutes, 15);
//! ```

mod database;
pub mod error;
pub mod models;
pub mod repository;
mod schema;
pub mod settings;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{Config, CredentialSummary, DailyPeak, UsageSample};
pub use repository::{ConfigRepo, CredentialsRepo, HistoryRepo};
pub use settings::Settings;
