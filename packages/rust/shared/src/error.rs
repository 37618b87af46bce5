//! Error types for QuestionTree.
//!
//! Library crates use [`QuestionTreeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only fatal conditions live here. Recoverable extraction conditions
//! (container not found, load timeouts, failed clicks, missing evidence) are
//! absorbed inside a run and never surface as errors.

use std::path::PathBuf;

/// Top-level error type for all QuestionTree operations.
#[derive(Debug, thiserror::Error)]
pub enum QuestionTreeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A rendering session could not be launched.
    #[error("session acquisition failed: {0}")]
    SessionAcquisition(String),

    /// Navigation to the target page failed outright.
    #[error("navigation error: {0}")]
    Navigation(String),

    /// A page-automation primitive failed (query, click, capture).
    #[error("page error: {0}")]
    Page(String),

    /// The rendering engine does not support an operation.
    #[error("unsupported by rendering engine: {0}")]
    Unsupported(String),

    /// A bounded operation ran out of time.
    #[error("timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// The caller cancelled the run.
    #[error("run cancelled")]
    Cancelled,

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A tracked target could not be checked during a scheduled cycle.
    #[error("tracked target {target_id} check failed: {message}")]
    TargetCheck { target_id: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (empty keyword, bad device, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, QuestionTreeError>;

impl QuestionTreeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is fatal for the run that raised it.
    ///
    /// Page-level failures degrade a run; everything else aborts it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Page(_) | Self::Unsupported(_) | Self::Timeout { .. }
        )
    }
}
