//! Error types for warpaug.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring or running an augmentation batch.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid option or combination of options.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Array rank or extent is unusable.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Input and requested output shapes disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Affine matrix contains non-finite entries.
    #[error("invalid affine: {0}")]
    InvalidAffine(String),

    /// The warp executor rejected or failed a job.
    #[error("executor {operation} failed: {reason}")]
    Executor {
        /// Executor phase that failed (`stage` or `resolve`).
        operation: String,
        /// Human-readable cause.
        reason: String,
    },

    /// I/O failure while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    pub(crate) fn executor(operation: &str, reason: impl Into<String>) -> Self {
        Self::Executor {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}
