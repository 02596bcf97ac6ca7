//! Error types for feedforge.
//!
//! Library crates use [`FeedforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type shared by all feedforge crates.
#[derive(Debug, thiserror::Error)]
pub enum FeedforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching a feed.
    #[error("network error: {0}")]
    Network(String),

    /// Feed parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Blob backend error (put/get/delete of artifact bytes).
    #[error("blob error at {locator}: {message}")]
    Blob { locator: String, message: String },

    /// Completion call failed after the controller gave up.
    #[error("completion error: {0}")]
    Completion(String),

    /// Queue send/receive error.
    #[error("queue error: {0}")]
    Queue(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (hash mismatch, malformed record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FeedforgeError>;

impl FeedforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a blob error for the given locator.
    pub fn blob(locator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Blob {
            locator: locator.into(),
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

    /// Storage errors are the ones worth retrying later; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Blob { .. } | Self::Network(_) | Self::Io { .. }
        )
    }
}
