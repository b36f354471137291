//! Core error types.

use thiserror::Error;

/// Errors that can occur in core operations.
///
/// Only I/O-facing operations return these. Extraction never fails, and
/// "process not running" style outcomes are modelled as values rather
/// than errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// HTTP transport error (connection refused, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-success status.
    #[error("Unexpected status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// URL that was requested.
        url: String,
    },

    /// Spawning or reading an OS utility failed.
    #[error("Command `{command}` failed: {reason}")]
    Command {
        /// The program that was run.
        command: String,
        /// What went wrong.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential storage error reported by a store implementation.
    #[error("Credential store error: {0}")]
    Store(String),

    /// Unknown provider identifier.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

impl CoreError {
    /// Creates a command error from a program name and reason.
    pub fn command(command: impl Into<String>, reason: impl ToString) -> Self {
        CoreError::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
