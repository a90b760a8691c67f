//! # RustKit Common
//!
//! Common utilities, error types, and logging configuration for the RustKit browser engine.
//!
//! ## Features
//!
//! - Unified error types with backtrace support
//! - Logging configuration and setup
//! - Single-threaded task sequences (`EventLoop` / `TaskRunner`)
//! - Waitable events and poison-tolerant locking

use thiserror::Error;

pub mod logging;
pub mod sync;
pub mod task;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use sync::{LockExt, ResetPolicy, WaitableEvent};
pub use task::{EventLoop, Task, TaskRunner};

/// Unified error type for RustKit.
#[derive(Error, Debug)]
pub enum RustKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancelled operation (the target sequence has shut down).
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl RustKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Get the error category for structured log fields.
    pub fn category(&self) -> &'static str {
        match self {
            RustKitError::Config { .. } => "config",
            RustKitError::Io(_) => "io",
            RustKitError::Cancelled => "cancelled",
            RustKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for RustKit operations.
pub type Result<T> = std::result::Result<T, RustKitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(RustKitError::config("test").category(), "config");
        assert_eq!(RustKitError::Cancelled.category(), "cancelled");
        assert_eq!(RustKitError::internal("bad state").category(), "internal");
    }

    #[test]
    fn test_config_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad byte");
        let err = RustKitError::config_with_source("parsing jobs config", source);
        assert_eq!(err.to_string(), "Config error: parsing jobs config");
        assert!(std::error::Error::source(&err).is_some());
    }
}
