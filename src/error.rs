//! # Error Handling
//!
//! This module defines the error types used across the relay and how the
//! HTTP-facing ones are converted to responses.
//!
//! ## Two families of errors:
//!
//! ### HTTP errors (`AppError`)
//! - Returned from actix-web handlers (health, metrics, config, WebSocket upgrade)
//! - Implement `ResponseError`, so `?` inside a handler produces a JSON error body
//!
//! ### Relay errors (`ProbeError`, `ConnectError`)
//! - Never leave the process as HTTP responses
//! - Scoped to one session: they end up as a WebSocket close frame sent to the client
//!   (see `relay::close`)
//!
//! ## Key Rust Concepts:
//! - **enum with data**: Each variant carries what is needed to describe the failure
//! - **Display trait**: Human-readable messages, also used as close reasons
//! - **std::error::Error**: Lets these errors flow through `anyhow` and `?`
//! - **From trait**: Automatic conversions so `?` works across error types

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the HTTP surface of the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **Unavailable**: The relay is draining and refuses new sessions (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Unavailable("relay is shutting down".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (unexpected failures while building a response)
    Internal(String),

    /// Client sent an invalid request (e.g. a WebSocket handshake that isn't one)
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// The relay is not accepting new sessions
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts `AppError` into a JSON HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "relay is draining",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR  // 500
            }
            AppError::BadRequest(_) => actix_web::http::StatusCode::BAD_REQUEST,  // 400
            AppError::Unavailable(_) => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Why the pre-flight probe of the upstream host failed.
///
/// Each variant carries the underlying error description so the client can be
/// told what actually went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Host name could not be resolved
    Dns(String),
    /// The host actively refused the TCP connection
    Refused(String),
    /// No response within the probe timeout
    Timeout(String),
    /// Any other transport failure (TLS, reset, malformed URL, ...)
    Other(String),
}

impl ProbeError {
    /// Short machine-readable class name, used in structured log events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Dns(_) => "dns",
            ProbeError::Refused(_) => "refused",
            ProbeError::Timeout(_) => "timeout",
            ProbeError::Other(_) => "other",
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Dns(msg) => write!(f, "DNS resolution failed: {}", msg),
            ProbeError::Refused(msg) => write!(f, "connection refused: {}", msg),
            ProbeError::Timeout(msg) => write!(f, "timed out: {}", msg),
            ProbeError::Other(msg) => write!(f, "network error: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Failure to open the authenticated upstream WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Upstream rejected the credential (HTTP 401/403 on the handshake)
    Unauthorized(u16),
    /// Upstream answered the handshake with some other HTTP status
    Rejected(u16),
    /// TCP/TLS/WebSocket failure before or during the handshake
    Transport(String),
    /// The upstream URL or credential header could not be built
    InvalidRequest(String),
}

impl ConnectError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Unauthorized(_) => "unauthorized",
            ConnectError::Rejected(_) => "rejected",
            ConnectError::Transport(_) => "transport",
            ConnectError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Unauthorized(status) => {
                write!(f, "upstream authentication failed (HTTP {})", status)
            }
            ConnectError::Rejected(status) => {
                write!(f, "upstream rejected the connection (HTTP {})", status)
            }
            ConnectError::Transport(msg) => write!(f, "upstream connection failed: {}", msg),
            ConnectError::InvalidRequest(msg) => write!(f, "invalid upstream request: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Type alias for handler results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
