//! Error types for taskmill
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Retryable / fatal classification
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,
    UnknownHost = 103,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    CorruptRecord = 210,

    // Staging errors (3xx)
    StagingFailed = 300,
    OutputMissing = 302,

    // Submission errors (4xx)
    SubmissionFailed = 400,

    // Execution / polling errors (5xx)
    ExecutionFailed = 500,
    PollTimeout = 501,
    CancelFailed = 502,

    // Signature errors (6xx)
    SignatureCorrupt = 600,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Staging errors
            400..=499 => 40, // Submission errors
            500..=599 => 50, // Execution errors
            600..=699 => 60, // Signature errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Host name not present in the configuration
    #[error("Unknown host: {name}")]
    UnknownHost { name: String },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted status or signature record could not be decoded
    #[error("Corrupt record: {path}")]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Staging Errors
    // ─────────────────────────────────────────────────────────────

    /// File staging failed before submission
    #[error("Staging failed for task {fingerprint}: {message}")]
    Staging { fingerprint: String, message: String },

    /// A declared local output was missing after completion
    #[error("Declared output missing after completion: {path}")]
    OutputMissing { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Submission Errors
    // ─────────────────────────────────────────────────────────────

    /// Backend rejected the task or was unreachable at submit time
    #[error("Submission failed on host '{host}': {message}")]
    Submission { host: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution / Polling Errors
    // ─────────────────────────────────────────────────────────────

    /// Task execution failed on the backend
    #[error("Task execution failed: {message}")]
    Execution {
        fingerprint: Option<String>,
        message: String,
    },

    /// A poll cycle could not reach the backend within its timeout
    #[error("Poll timed out on host '{host}' after {timeout_secs}s")]
    PollTimeout { host: String, timeout_secs: u64 },

    /// Backend cancellation was rejected
    #[error("Failed to cancel task {fingerprint}: {message}")]
    CancelFailed { fingerprint: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Signature Errors
    // ─────────────────────────────────────────────────────────────

    /// A persisted signature could not be decoded
    #[error("Corrupt signature: {path}")]
    SignatureCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::UnknownHost { .. } => ErrorCode::UnknownHost,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::CorruptRecord { .. } => ErrorCode::CorruptRecord,
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Staging { .. } => ErrorCode::StagingFailed,
            Error::OutputMissing { .. } => ErrorCode::OutputMissing,

            Error::Submission { .. } => ErrorCode::SubmissionFailed,

            Error::Execution { .. } => ErrorCode::ExecutionFailed,
            Error::PollTimeout { .. } => ErrorCode::PollTimeout,
            Error::CancelFailed { .. } => ErrorCode::CancelFailed,
            Error::SignatureCorrupt { .. } => ErrorCode::SignatureCorrupt,

            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PollTimeout { .. }
                | Error::Submission { .. }
                | Error::CancelFailed { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (operation must abort)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::UnknownHost { .. }
                | Error::CorruptRecord { .. }
                | Error::SignatureCorrupt { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unknown host error
    pub fn unknown_host(name: impl Into<String>) -> Self {
        Error::UnknownHost { name: name.into() }
    }

    /// Create a staging error
    pub fn staging(fingerprint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Staging {
            fingerprint: fingerprint.into(),
            message: message.into(),
        }
    }

    /// Create a submission error
    pub fn submission(host: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Submission {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Error::Execution {
            fingerprint: None,
            message: message.into(),
        }
    }

    /// Create a poll timeout error
    pub fn poll_timeout(host: impl Into<String>, timeout_secs: u64) -> Self {
        Error::PollTimeout {
            host: host.into(),
            timeout_secs,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::StagingFailed.as_str(), "E300");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::StagingFailed.exit_code(), 30);
        assert_eq!(ErrorCode::SubmissionFailed.exit_code(), 40);
        assert_eq!(ErrorCode::PollTimeout.exit_code(), 50);
    }

    #[test]
    fn test_error_codes() {
        let err = Error::config_not_found("/test");
        assert_eq!(err.code(), ErrorCode::ConfigNotFound);

        let err = Error::submission("pbs", "qsub exited 1");
        assert_eq!(err.code(), ErrorCode::SubmissionFailed);

        let err = Error::OutputMissing { path: "/a".into() };
        assert_eq!(err.code(), ErrorCode::OutputMissing);
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::poll_timeout("pbs", 30).is_retryable());
        assert!(Error::submission("pbs", "unreachable").is_retryable());
        assert!(!Error::config_not_found("/test").is_retryable());
        assert!(!Error::unknown_host("nope").is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::config_not_found("/test").is_fatal());
        assert!(Error::unknown_host("nope").is_fatal());
        assert!(!Error::poll_timeout("pbs", 30).is_fatal());
        assert!(!Error::OutputMissing { path: "/o".into() }.is_fatal());
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::unknown_host("cluster9");
        let formatted = err.format_for_log();
        assert!(formatted.contains("[E103]"));
        assert!(formatted.contains("cluster9"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
