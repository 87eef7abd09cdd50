//! Error types for the CLEAR knowledge-graph pipeline.
//!
//! Library crates use [`ClearKgError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum ClearKgError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A required input file does not exist.
    #[error("required input not found: {}", path.display())]
    MissingInput { path: PathBuf },

    /// Input had an unexpected shape or an unparseable value.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Task-status storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (empty join result, bad record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// No task record exists for the given id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A pipeline stage failed; `stage` is its failure prefix.
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        source: Box<ClearKgError>,
    },

    /// The task was cancelled while a stage was running.
    #[error("task cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ClearKgError>;

impl ClearKgError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach a stage prefix. Cancellation passes through unchanged.
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            Self::Cancelled => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Report a required input file as missing.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self::MissingInput { path: path.into() }
    }
}
