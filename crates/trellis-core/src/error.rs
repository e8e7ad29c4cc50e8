//! Error types for Trellis

use crate::response::ErrorResponse;
use std::time::Duration;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for Trellis
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or missing run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run configuration names a runtype this binary does not support
    #[error("Unknown runtype '{0}'")]
    UnknownRuntype(String),

    /// Builtin runner references a key that was never registered
    #[error("Unknown builtin key '{0}'")]
    UnknownBuiltinKey(String),

    /// The OS refused to spawn a process
    #[error("Failed to spawn '{runner}': {message}")]
    ProcessSpawn {
        /// Runner identifier (plugin/name)
        runner: String,
        /// Error message
        message: String,
    },

    /// Process exited before it was expected to
    #[error("Process exited: {0}")]
    ProcessExited(String),

    /// A runner's declared endpoint never accepted connections
    #[error("Endpoint '{endpoint}' did not open within {timeout:?}")]
    EndpointTimeout {
        /// The endpoint being waited on
        endpoint: String,
        /// How long we waited
        timeout: Duration,
    },

    /// Referenced runner, plugin or resource is not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Runner exists but has not resolved a handler
    #[error("No handler found for {0}")]
    NoHandler(String),

    /// A concurrent close is already underway
    #[error("Already closing")]
    AlreadyClosing,

    /// The plugin manager was closed while plugins were loading
    #[error("Plugin manager was closed during loading")]
    ConcurrentClose,

    /// Reload was requested while plugins are loaded or loading
    #[error("Plugins are already loaded or loading")]
    AlreadyLoading,

    /// Access denied by the domain layer
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Unknown source type
    #[error("Unknown source type '{0}'")]
    UnknownSourceType(String),

    /// Upstream connection or protocol failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Embedded database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    /// Error reported by a handler through a structured error body
    #[error("{0}")]
    Response(#[from] ErrorResponse),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Config(_) | Error::UnknownSourceType(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::NoHandler(_) => StatusCode::NOT_FOUND,
            Error::AccessDenied(_) => StatusCode::FORBIDDEN,
            Error::Upstream(_) | Error::EndpointTimeout { .. } => StatusCode::BAD_GATEWAY,
            Error::AlreadyClosing | Error::ConcurrentClose | Error::AlreadyLoading => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code used in [`ErrorResponse::error`]
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::UnknownRuntype(_) | Error::UnknownBuiltinKey(_) => "unknown_runtype",
            Error::ProcessSpawn { .. } | Error::ProcessExited(_) => "process_error",
            Error::EndpointTimeout { .. } | Error::Upstream(_) => "plugin_error",
            Error::NotFound(_) | Error::NoHandler(_) => "not_found",
            Error::AlreadyClosing | Error::ConcurrentClose | Error::AlreadyLoading => "loading",
            Error::AccessDenied(_) => "access_denied",
            Error::UnknownSourceType(_) => "bad_request",
            Error::Response(_) => "plugin_error",
            _ => "internal_error",
        }
    }

    /// Structured error body describing this error
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Error::Response(er) => er.clone(),
            other => ErrorResponse::new(other.code(), other.to_string()),
        }
    }

    /// Create a process spawn error
    pub fn spawn(runner: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::ProcessSpawn {
            runner: runner.into(),
            message: message.to_string(),
        }
    }

    /// Create a config error
    pub fn config(message: impl std::fmt::Display) -> Self {
        Error::Config(message.to_string())
    }
}
