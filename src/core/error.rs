//! Unified error handling for urlremap.
//!
//! Build-time errors carry enough context to be logged once and acted on;
//! rule-level problems are downgraded to warnings by the compiler and never
//! surface through this type.

use std::fmt;

/// Unified error types for the rewriting engine.
#[derive(Debug)]
pub enum RemapError {
    /// Configuration-related errors (service config or a rule line).
    Config(String),

    /// I/O errors reading the rule file or service config.
    Io(std::io::Error),

    /// Plugin shared-object load, init or new-instance failures. Fatal to
    /// startup: a half-loaded remap plugin would silently misroute traffic.
    PluginLoad(String),

    /// Host resolution failures during build.
    Resolver(String),

    /// Internal invariant violations.
    Internal(String),
}

impl fmt::Display for RemapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemapError::Config(msg) => write!(f, "Configuration error: {msg}"),
            RemapError::Io(err) => write!(f, "I/O error: {err}"),
            RemapError::PluginLoad(msg) => write!(f, "Plugin load failed: {msg}"),
            RemapError::Resolver(msg) => write!(f, "Host resolution failed: {msg}"),
            RemapError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for RemapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemapError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RemapError {
    fn from(err: std::io::Error) -> Self {
        RemapError::Io(err)
    }
}

/// Result type alias for rewriting-engine operations.
pub type RemapResult<T> = std::result::Result<T, RemapError>;

/// Helper trait for adding context to errors.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> RemapResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> RemapResult<T> {
        self.map_err(|e| RemapError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation.
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::RemapError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::RemapError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! plugin_error {
    ($msg:expr) => {
        $crate::core::RemapError::PluginLoad($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::RemapError::PluginLoad(format!($fmt, $($arg)*))
    };
}
