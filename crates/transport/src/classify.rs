//! Error classification shared by the HTTP pipeline and the realtime channel
//!
//! Maps a `RawFailure` into an `ApiError` carrying a kind and a retryability
//! flag. HTTP failures are classified by status code; channel failures by
//! their reason string. Only the pipeline's single refresh-and-replay acts on
//! `Unauthorized` automatically; every other retryable kind is advice for the
//! caller's own policy.

use std::fmt;
use std::time::Duration;

use crate::request::RawFailure;

/// Reason the realtime server sends when it closes the connection on purpose.
/// The channel must not reconnect after seeing it.
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response reached the client
    Network,
    /// 401, retryable once through the refresh path
    Unauthorized,
    /// 403, never retried
    Forbidden,
    /// 400/422, caller-fixable
    Validation,
    /// 429, retryable by the caller after a delay
    RateLimited,
    /// 5xx, retryable by caller policy
    Server,
    /// Local deadline exceeded
    Timeout,
    /// Realtime channel failure carrying a reason
    Socket,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Socket => "socket",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Machine-readable code used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Server => "SERVER_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Socket => "SOCKET_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Best-effort mapping from an envelope error code back to a kind.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "UNAUTHORIZED" | "TOKEN_EXPIRED" | "INVALID_TOKEN" => ErrorKind::Unauthorized,
            "FORBIDDEN" => ErrorKind::Forbidden,
            "VALIDATION_ERROR" | "BAD_REQUEST" => ErrorKind::Validation,
            "RATE_LIMITED" | "TOO_MANY_REQUESTS" => ErrorKind::RateLimited,
            "SERVER_ERROR" | "INTERNAL_ERROR" => ErrorKind::Server,
            "NETWORK_ERROR" => ErrorKind::Network,
            "TIMEOUT" => ErrorKind::Timeout,
            "SOCKET_ERROR" => ErrorKind::Socket,
            _ => ErrorKind::Unknown,
        }
    }

    /// Default retryability for the kind.
    fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Unauthorized
                | ErrorKind::RateLimited
                | ErrorKind::Server
                | ErrorKind::Timeout
                | ErrorKind::Socket
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A typed, classified failure. This is the only error shape callers of the
/// pipeline or channel ever receive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
    /// Server-provided error code from the envelope, if any
    pub code: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            status: None,
            code: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message).with_status(401)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("deadline of {}ms exceeded", after.as_millis()),
        )
    }

    pub fn socket(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        classify_disconnect(&reason)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }

    /// Envelope code: the server's own code when present, else the kind's.
    pub fn envelope_code(&self) -> &str {
        self.code.as_deref().unwrap_or_else(|| self.kind.code())
    }
}

/// Classify any raw transport failure.
pub fn classify(raw: &RawFailure) -> ApiError {
    match raw {
        RawFailure::Status { status, body } => classify_status(*status, body),
        RawFailure::Network(message) => ApiError::new(ErrorKind::Network, message.clone()),
        RawFailure::Timeout(after) => ApiError::timeout(*after),
        RawFailure::Socket(reason) => classify_disconnect(reason),
    }
}

/// Classify an HTTP failure by status, taking the message from the response
/// envelope when the body carries one.
pub fn classify_status(status: u16, body: &str) -> ApiError {
    let kind = match status {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        400 | 422 => ErrorKind::Validation,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    };
    let (code, message) = extract_message(body);
    let message = message.unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("request failed with status {status}")
        } else {
            body.trim().to_string()
        }
    });
    let error = ApiError::new(kind, message).with_status(status);
    match code {
        Some(code) => error.with_code(code),
        None => error,
    }
}

/// Classify a realtime channel close/error reason.
///
/// A server-initiated disconnect is final; every other reason is retryable.
pub fn classify_disconnect(reason: &str) -> ApiError {
    let mut error = ApiError::new(ErrorKind::Socket, reason);
    error.retryable = !is_server_disconnect(reason);
    error
}

/// Whether the close reason means the server told the client to stay away.
pub fn is_server_disconnect(reason: &str) -> bool {
    reason == SERVER_DISCONNECT_REASON
}

/// Pull `(code, message)` out of an envelope body:
/// `{"error":{"code","message"}}` or `{"message": ...}`.
fn extract_message(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };
    if let Some(error) = value.get("error") {
        let code = error
            .get("code")
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string));
        if code.is_some() || message.is_some() {
            return (code, message);
        }
    }
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    (None, message)
}
