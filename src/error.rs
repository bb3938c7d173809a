//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: errors returned by HTTP handlers, rendered as JSON responses
//! - **SessionError**: failures inside a realtime voice session (capture, connect,
//!   decode, transport)
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Fatal vs non-fatal session errors:
//! Every session error except `DecodeError` ends the session. A fragment that
//! cannot be decoded is dropped and the stream keeps going.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **SessionLimit**: Too many concurrent voice sessions (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::NotFound(format!("Session '{}' not found", id)));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The service is already running the maximum number of voice sessions
    SessionLimit(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::SessionLimit(msg) => write!(f, "Session limit reached: {}", msg),
        }
    }
}

/// Converts AppError into an HTTP response.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - SessionLimit → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 'abc' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
            AppError::SessionLimit(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "session_limit",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Failures inside a realtime voice session.
///
/// ## Taxonomy:
/// - **CaptureUnavailable**: microphone denied, revoked, or its stream ended (fatal)
/// - **ConnectError**: live endpoint unreachable or rejected the setup (fatal)
/// - **DecodeError**: an inbound fragment could not be decoded (non-fatal, fragment dropped)
/// - **TransportError**: the live connection failed mid-session (fatal)
/// - **InvalidState**: an operation was requested in a state that does not allow it
/// - **Cancelled**: `start()` was overtaken by `stop()` while it was awaiting
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    CaptureUnavailable(String),
    ConnectError(String),
    DecodeError(String),
    TransportError(String),
    InvalidState(String),
    Cancelled,
}

impl SessionError {
    /// Whether this error must end the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::DecodeError(_))
    }

    /// Machine-readable code used in WebSocket error messages.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::CaptureUnavailable(_) => "capture_unavailable",
            SessionError::ConnectError(_) => "connect_error",
            SessionError::DecodeError(_) => "decode_error",
            SessionError::TransportError(_) => "transport_error",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::CaptureUnavailable(msg) => write!(f, "Microphone unavailable: {}", msg),
            SessionError::ConnectError(msg) => write!(f, "Could not connect to live endpoint: {}", msg),
            SessionError::DecodeError(msg) => write!(f, "Could not decode audio: {}", msg),
            SessionError::TransportError(msg) => write!(f, "Live transport failed: {}", msg),
            SessionError::InvalidState(msg) => write!(f, "Invalid session state: {}", msg),
            SessionError::Cancelled => write!(f, "Session start was cancelled by stop"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

/// Type alias for Results inside the streaming core.
pub type SessionResult<T> = Result<T, SessionError>;
