//! Error types for postdigest.
//!
//! Library crates use [`PostDigestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all postdigest operations.
#[derive(Debug, thiserror::Error)]
pub enum PostDigestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network or extraction failure for a single source.
    #[error("fetch error for {source_url}: {message}")]
    Fetch { source_url: String, message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Delivery failure for one recipient/message.
    #[error("send error to {recipient}: {message}")]
    Send { recipient: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad locator, bad time-of-day, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The daily job scheduler failed to start or stop.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// A pipeline run is already in progress.
    #[error("a pipeline run is already in progress")]
    Busy,

    /// The run was stopped by a shutdown signal before it completed.
    #[error("pipeline run cancelled by shutdown")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PostDigestError>;

impl PostDigestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a fetch error for `source_url`.
    pub fn fetch(source_url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            source_url: source_url.into(),
            message: msg.into(),
        }
    }

    /// Create a send error for `recipient`.
    pub fn send(recipient: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Send {
            recipient: recipient.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PostDigestError::config("missing bot token");
        assert_eq!(err.to_string(), "config error: missing bot token");

        let err = PostDigestError::fetch("https://t.me/s/jobs", "HTTP 502 Bad Gateway");
        assert_eq!(
            err.to_string(),
            "fetch error for https://t.me/s/jobs: HTTP 502 Bad Gateway"
        );

        let err = PostDigestError::send("12345", "Forbidden: bot was blocked by the user");
        assert!(err.to_string().starts_with("send error to 12345"));
    }

    #[test]
    fn busy_is_distinct() {
        assert!(matches!(PostDigestError::Busy, PostDigestError::Busy));
        assert!(PostDigestError::Busy.to_string().contains("already in progress"));
    }
}
