//! Request, response and raw failure values exchanged with a transport

use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;

use crate::classify::{ApiError, ErrorKind};

/// An outbound API call, relative to the transport's base URL.
///
/// Cloneable so the pipeline can replay it after a token refresh: the request
/// itself is the replay recipe.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path and optional query string, e.g. `/api/votes?page=2`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Per-call deadline; the pipeline default applies when `None`
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Attach a JSON body and the matching content type.
    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Path without the query string, used for routing and logging.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// The bearer token carried by this request, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// A response that reached the client, of any status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// A JSON response with the content type set.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ApiError::new(
                ErrorKind::Unknown,
                format!("invalid JSON response body: {e}"),
            )
            .with_status(self.status)
        })
    }
}

/// A failure as the transport saw it, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// A response arrived with a non-success status
    Status { status: u16, body: String },
    /// No response reached the client (DNS, connect, reset, body read)
    Network(String),
    /// The local deadline elapsed first
    Timeout(Duration),
    /// The realtime channel closed or errored with a reason string
    Socket(String),
}

impl RawFailure {
    /// Lift a non-success response into a raw failure.
    pub fn from_response(response: &HttpResponse) -> Self {
        RawFailure::Status {
            status: response.status,
            body: response.text(),
        }
    }
}
