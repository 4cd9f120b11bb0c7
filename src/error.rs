//! Error types for polyflow.
//!
//! Errors follow the compile/convert/reconcile taxonomy: every variant
//! carries a code the CLI and the agent can classify without parsing
//! message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for polyflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// polyflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Shape or type violation in a raw spec.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Semantic violation (missing required input, incompatible ref type, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Stage-level compilation failure.
    #[error("Compiler error: {0}")]
    Compiler(String),

    /// Projection failure while building runtime resources.
    #[error("Converter error: {0}")]
    Converter(String),

    /// Runtime driver failure, with the original status code when known.
    #[error("Executor error{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Executor {
        status: Option<u16>,
        message: String,
    },

    /// Retryable failure (network, 5xx).
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an executor error from a driver status code.
    pub fn executor(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Executor {
            status,
            message: message.into(),
        }
    }

    /// Get the error code for programmatic parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Schema(_) => "SCHEMA_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Compiler(_) => "COMPILER_ERROR",
            Error::Converter(_) => "CONVERTER_ERROR",
            Error::Executor { .. } => "EXECUTOR_ERROR",
            Error::Transient(_) => "TRANSIENT_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Error class name, used as the `reason` of failed status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Schema(_) | Error::Yaml(_) | Error::Json(_) => "SchemaError",
            Error::Validation(_) => "ValidationError",
            Error::Compiler(_) => "CompilerError",
            Error::Converter(_) => "ConverterError",
            Error::Executor { .. } => "ExecutorError",
            Error::Transient(_) | Error::Http(_) => "TransientError",
            Error::Config(_) => "ConfigError",
            Error::Io(_) => "IoError",
        }
    }

    /// CLI exit code: 1 generic, 2 validation, 3 compilation, 4 runtime.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Schema(_) | Error::Validation(_) | Error::Yaml(_) | Error::Json(_) => 2,
            Error::Compiler(_) => 3,
            Error::Converter(_) | Error::Executor { .. } | Error::Transient(_) => 4,
            Error::Config(_) | Error::Http(_) | Error::Io(_) => 1,
        }
    }

    /// Original status code carried by driver and HTTP failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Executor { status, .. } => *status,
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            Error::Executor {
                status: Some(status),
                ..
            } => *status >= 500 || *status == 409,
            _ => false,
        }
    }

    /// Prefix the message with the path of the offending spec element.
    pub fn at(self, path: &str) -> Self {
        match self {
            Error::Schema(msg) => Error::Schema(format!("{}: {}", path, msg)),
            Error::Validation(msg) => Error::Validation(format!("{}: {}", path, msg)),
            Error::Compiler(msg) => Error::Compiler(format!("{}: {}", path, msg)),
            Error::Converter(msg) => Error::Converter(format!("{}: {}", path, msg)),
            other => other,
        }
    }

    /// Structured error report.
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            reason: self.reason().to_string(),
            message: self.to_string(),
            status: self.status(),
        }
    }
}

/// Serializable error summary attached to failed status conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Validation("x".into()).exit_code(), 2);
        assert_eq!(Error::Schema("x".into()).exit_code(), 2);
        assert_eq!(Error::Compiler("x".into()).exit_code(), 3);
        assert_eq!(Error::Converter("x".into()).exit_code(), 4);
        assert_eq!(Error::Config("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_executor_status() {
        let err = Error::executor(Some(409), "already exists");
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Executor error (409): already exists");

        let err = Error::executor(None, "boom");
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "Executor error: boom");
    }

    #[test]
    fn test_at_prefixes_path() {
        let err = Error::Validation("missing".into()).at("inputs[lr]");
        assert_eq!(err.to_string(), "Validation error: inputs[lr]: missing");
    }

    #[test]
    fn test_report() {
        let report = Error::Compiler("cycle".into()).to_report();
        assert_eq!(report.code, "COMPILER_ERROR");
        assert_eq!(report.reason, "CompilerError");
        assert!(report.message.contains("cycle"));
    }
}
