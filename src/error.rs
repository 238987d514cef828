//! Custom error types for the sweep orchestrator.
//!
//! This module defines the primary error type, `SweepError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a measurement
//! run can encounter.
//!
//! ## Error Hierarchy
//!
//! - **`Instrument`**: A read or write against an instrument endpoint failed
//!   (communication failure, timeout). Never retried automatically; the
//!   in-progress sweep aborts and the run is finalized as failed with its
//!   partial data preserved.
//! - **`Configuration`**: Semantic errors caught before any hardware or file
//!   activity: non-positive gain, mismatched setpoint lists, an unusable
//!   base directory.
//! - **`Config`**: Wraps `figment` errors from loading the settings file or
//!   environment overrides.
//! - **`Storage`**: Run-directory allocation or finalize-time verification
//!   failed in a way that is not a plain I/O error.
//! - **`Io` / `Csv` / `Json`**: Underlying file, table, and metadata
//!   serialization failures, converted via `#[from]` so `?` works
//!   throughout the store.
//!
//! Interruption is deliberately *not* an error: an interrupted run finalizes
//! with partial data and is reported through
//! [`RunStatus`](crate::metadata::RunStatus) on the returned result.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Errors surfaced by sweep operations and the result store.
#[derive(Error, Debug)]
pub enum SweepError {
    /// A read or write against an instrument endpoint failed
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Semantic misconfiguration caught before hardware or file activity
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings file or environment loading failed
    #[error("Settings error: {0}")]
    Config(#[from] figment::Error),

    /// Run allocation or finalize-time verification failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Underlying file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tabular data encoding failure
    #[error("Table write error: {0}")]
    Csv(#[from] csv::Error),

    /// Metadata serialization failure
    #[error("Metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    /// Build an instrument error from any displayable source.
    pub fn instrument(msg: impl std::fmt::Display) -> Self {
        SweepError::Instrument(msg.to_string())
    }

    /// True if this error came from an instrument endpoint rather than the
    /// orchestrator or the store.
    pub fn is_instrument(&self) -> bool {
        matches!(self, SweepError::Instrument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SweepError::Instrument("lock-in timed out".to_string());
        assert_eq!(err.to_string(), "Instrument error: lock-in timed out");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SweepError = io.into();
        assert!(matches!(err, SweepError::Io(_)));
        assert!(!err.is_instrument());
    }
}
