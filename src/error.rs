//! Error types for Simphoni
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly hints
//! - Exit codes for the CLI
//!
//! Model backend failures have their own [`InvocationError`] type because they
//! are recorded inside a Thread's output log as well as surfaced to callers.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Simphoni operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoNotFound = 203,

    // Validation errors (3xx)
    SchemaInvalid = 300,
    PersonaInvalid = 301,
    DocumentMalformed = 302,

    // Access errors (4xx)
    AccessDenied = 400,

    // Execution errors (5xx)
    InvocationFailed = 500,
    InvocationTimeout = 501,
    InvalidTransition = 502,
    ThreadFailed = 503,

    // Storage errors (6xx)
    StorageFailed = 600,
    RecordNotFound = 601,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Invocation Errors
// ─────────────────────────────────────────────────────────────────

/// Failure reported by a model backend for a single invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The backend did not answer in time
    #[error("invocation timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    /// The provider answered with an error
    #[error("provider error: {message}")]
    Provider { message: String },

    /// The provider answered with something we could not interpret
    #[error("malformed response: {message}")]
    Malformed { message: String },

    /// No backend is able to serve this model
    #[error("no backend serves model '{model_ref}'")]
    Unsupported { model_ref: String },
}

impl InvocationError {
    pub fn provider(message: impl Into<String>) -> Self {
        InvocationError::Provider {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        InvocationError::Malformed {
            message: message.into(),
        }
    }

    /// Whether a caller-level retry has a reasonable chance of succeeding
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvocationError::Timeout { .. } | InvocationError::Provider { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Main Error
// ─────────────────────────────────────────────────────────────────

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO / Encoding Errors
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

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Validation Errors
    // ─────────────────────────────────────────────────────────────

    /// A schema, persona or request failed structural checks
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────
    // Access Errors
    // ─────────────────────────────────────────────────────────────

    /// Requester lacks permission
    #[error("Access denied: {message}")]
    Auth { message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// Model backend failure
    #[error("Invocation failed: {0}")]
    Invocation(#[from] InvocationError),

    /// A thread command is not allowed in the thread's current status
    #[error("Cannot {command} a thread that is {from}")]
    InvalidTransition { from: String, command: String },

    /// A thread ran and ended Failed
    #[error("Thread {thread_id} failed: {message}")]
    ThreadFailed { thread_id: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────

    /// Document store failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Record does not exist
    #[error("No record '{id}' in collection '{collection}'")]
    NotFound { collection: String, id: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse(_) => ErrorCode::ConfigParseError,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                _ => ErrorCode::IoRead,
            },
            Error::Json(_) => ErrorCode::DocumentMalformed,
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Validation { field, .. } => match field.as_deref() {
                Some(f) if f.starts_with("persona") => ErrorCode::PersonaInvalid,
                _ => ErrorCode::SchemaInvalid,
            },

            Error::Auth { .. } => ErrorCode::AccessDenied,

            Error::Invocation(InvocationError::Timeout { .. }) => ErrorCode::InvocationTimeout,
            Error::Invocation(_) => ErrorCode::InvocationFailed,
            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::ThreadFailed { .. } => ErrorCode::ThreadFailed,

            Error::Storage { .. } => ErrorCode::StorageFailed,
            Error::NotFound { .. } => ErrorCode::RecordNotFound,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get the CLI exit code
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Whether a caller-level retry might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Invocation(e) => e.is_retryable(),
            Error::Storage { .. } => true,
            _ => false,
        }
    }

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => {
                Some("Run 'simphoni config init' to create a default configuration file.")
            }
            Error::ConfigParse(_) => Some(
                "Check your configuration file syntax. Run 'simphoni config validate' to see details.",
            ),
            Error::Validation { .. } => Some(
                "Fix the schema or persona file and run 'simphoni validate' before starting a thread.",
            ),
            Error::Auth { .. } => {
                Some("Only the owner, or users on an Exclusive allow-list, can use this record.")
            }
            Error::Invocation(InvocationError::Timeout { .. }) => Some(
                "The model backend is slow or unreachable. Raise 'invocation_timeout_secs' or check the backend.",
            ),
            Error::Invocation(InvocationError::Unsupported { .. }) => {
                Some("Add a backend route for this model prefix in the [backend] section.")
            }
            Error::Storage { .. } => {
                Some("Check that the data directory is writable. Outputs produced so far were kept.")
            }
            Error::ThreadFailed { .. } => {
                Some("Run 'simphoni thread show <id>' to see which step failed.")
            }
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl fmt::Display, command: impl fmt::Display) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            command: command.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
