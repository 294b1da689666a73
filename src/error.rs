//! Error types for the resolution engine.
//!
//! All errors are strongly typed using thiserror. Only input validation ever
//! reaches callers of the public operations; storage and oracle failures are
//! converted into degraded operation or sentinel outcomes at the boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Validation errors that occur during input or configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Entity name cannot be empty")]
    EmptyEntityName,

    #[error("Context rule keyword cannot be empty")]
    EmptyKeyword,

    #[error("Category cannot be empty")]
    EmptyCategory,

    #[error("Threshold '{field}' value {value} is out of range [0.0, 1.0]")]
    ThresholdOutOfRange {
        field: &'static str,
        value: f32,
    },

    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },
}

/// Errors raised by the JSON document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document {path}: {message}")]
    Serialization {
        path: PathBuf,
        message: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by the external embedding and classification ports.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Oracle returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl OracleError {
    /// Returns true for transport failures worth another attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Calls `call` up to `1 + retries` times, returning the first success or the
/// last error. Malformed responses are retried too.
pub(crate) fn retry_oracle<T>(
    retries: u32,
    mut call: impl FnMut() -> Result<T, OracleError>,
) -> Result<T, OracleError> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "oracle call failed; retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Entity not found: {name}")]
    EntityNotFound {
        name: String,
    },
}

impl EngineError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Oracle(e) => e.is_transient(),
            Self::Store(StoreError::Io { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
