//! Error handling for the measurement engine
//!
//! This module defines the error taxonomy shared by the instrument driver,
//! the acquisition worker, the data sink and the engine, plus a Result alias
//! used throughout the crate.
//!
//! Errors fall in two groups:
//!
//! - **Point-level** ([`EngineError::Timeout`], [`EngineError::Range`]): the
//!   worker reports them as warnings and keeps going.
//! - **Session-level** (everything else raised during a session): the session
//!   is faulted, the source is brought back to 0 V and the handle is closed.

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Parameters rejected before any instrument I/O
    #[error("Invalid parameters: {0}")]
    Validation(String),

    /// A session is already running or still stopping
    #[error("A measurement session is already active")]
    AlreadyRunning,

    /// The instrument did not answer within the bounded wait
    #[error("Instrument timeout: {0}")]
    Timeout(String),

    /// The instrument answered with something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Requested voltage lies outside the configured source range
    #[error("Voltage {voltage} V is outside the source range of ±{limit} V")]
    Range { voltage: f64, limit: f64 },

    /// IO errors (transport and data sink)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Errors related to configuration, command tables and resource strings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation on an instrument handle that was already closed
    #[error("Instrument is not connected")]
    NotConnected,

    /// Retry requested but every session has already been committed
    #[error("No unsaved session data")]
    NoPendingData,

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error only affects the current point of a session
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            EngineError::Timeout(_) | EngineError::Range { .. }
        )
    }

    /// Whether this is an instrument timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), EngineError::Timeout(_))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Validation("voltage_step must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid parameters: voltage_step must be > 0"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = EngineError::Protocol("garbage".to_string());
        let with_ctx = err.with_context("MEAS:CURR?");
        assert!(with_ctx.to_string().contains("MEAS:CURR?"));
        assert!(matches!(with_ctx.root(), EngineError::Protocol(_)));
    }

    #[test]
    fn test_range_error() {
        let err = EngineError::Range {
            voltage: 250.0,
            limit: 210.0,
        };
        assert!(err.to_string().contains("250"));
        assert!(err.to_string().contains("210"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::Timeout("x".into()).is_recoverable());
        assert!(EngineError::Range {
            voltage: 1.0,
            limit: 0.5
        }
        .is_recoverable());
        assert!(EngineError::Timeout("x".into())
            .with_context("read")
            .is_recoverable());
        assert!(!EngineError::Protocol("x".into()).is_recoverable());
        assert!(!EngineError::NotConnected.is_recoverable());
    }
}
