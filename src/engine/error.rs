//! Error taxonomy shared by every engine component

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced in `OperationResult.error`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No data (or no such application/record). Informational for callers.
    #[error("not found: {app}: {detail}")]
    NotFound { app: String, detail: String },

    /// A target process is alive and was not (or could not be) stopped
    #[error("{app} is running (pid {}); close it or use force termination", format_pids(.pids))]
    ProcessRunning { app: String, pids: Vec<u32> },

    /// Archive contents do not match the recorded hash
    #[error("integrity check failed for backup {record_id}: expected {expected}, found {actual}")]
    Integrity {
        record_id: String,
        expected: String,
        actual: String,
    },

    /// An identity file could not be parsed in the expected shape
    #[error("unsupported identity file {}: {detail}", .path.display())]
    UnsupportedFormat { path: PathBuf, detail: String },

    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("operation cancelled before {step}")]
    Cancelled { step: String },

    /// A data root is a directory the engine must never replace or remove
    #[error("refusing to touch {}: {detail}", .path.display())]
    UnsafePath { path: PathBuf, detail: String },

    /// Catch-all for unexpected failures
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(app: &str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            app: app.to_string(),
            detail: detail.into(),
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn unsafe_path(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::UnsafePath {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ProcessRunning { .. } => "process_running",
            Self::Integrity { .. } => "integrity",
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::InsufficientSpace { .. } => "insufficient_space",
            Self::Cancelled { .. } => "cancelled",
            Self::UnsafePath { .. } => "unsafe_path",
            Self::Internal(_) => "internal",
        }
    }
}

fn format_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Serialize for EngineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EngineError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// `with_context` for engine results: wraps any displayable error as `Internal`
pub(crate) trait InternalContext<T> {
    fn internal<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T, E: Display> InternalContext<T> for std::result::Result<T, E> {
    fn internal<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|e| EngineError::Internal(format!("{}: {}", context(), e)))
    }
}
