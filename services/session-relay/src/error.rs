//! Error envelope responses
//!
//! Every failure the relay produces on its own (classified upstream errors,
//! unreadable request bodies, bad login payloads) leaves as the dashboard's
//! error envelope:
//!
//! `{"success":false,"error":{"code","message","context":{"request_id","retryable"}}}`

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use transport::{ApiError, ErrorKind, error_envelope};

/// A classified failure bound to the request it failed.
#[derive(Debug)]
pub struct RelayError {
    pub error: ApiError,
    pub request_id: String,
}

impl RelayError {
    pub fn new(error: ApiError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    /// Failure raised by the relay itself rather than the API.
    pub fn local(
        status: StatusCode,
        kind: ErrorKind,
        message: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self::new(
            ApiError::new(kind, message).with_status(status.as_u16()),
            request_id,
        )
    }
}

/// Status a classified error is reported with. An HTTP status carried by
/// the error wins; otherwise the kind decides.
pub fn status_for(error: &ApiError) -> StatusCode {
    if let Some(status) = error.status.and_then(|s| StatusCode::from_u16(s).ok()) {
        return status;
    }
    match error.kind {
        ErrorKind::Network | ErrorKind::Socket => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Server | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = error_envelope(
            self.error.envelope_code(),
            &self.error.message,
            serde_json::json!({
                "request_id": self.request_id,
                "retryable": self.error.retryable,
            }),
        );
        (
            status_for(&self.error),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn local_failures_map_by_kind() {
        assert_eq!(
            status_for(&ApiError::new(ErrorKind::Network, "refused")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ApiError::timeout(Duration::from_secs(30))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ApiError::socket("transport close")),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn carried_status_wins() {
        let error = ApiError::new(ErrorKind::Server, "maintenance").with_status(503);
        assert_eq!(status_for(&error), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&ApiError::unauthorized("expired")),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn envelope_carries_code_request_id_and_retryable() {
        let error = ApiError::new(ErrorKind::RateLimited, "slow down")
            .with_status(429)
            .with_code("RATE_LIMITED");
        let response = RelayError::new(error, "req_abc123").into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["message"], "slow down");
        assert_eq!(body["error"]["context"]["request_id"], "req_abc123");
        assert_eq!(body["error"]["context"]["retryable"], true);
    }

    #[tokio::test]
    async fn local_error_uses_kind_code() {
        let response = RelayError::local(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "invalid request body",
            "req_1",
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], ErrorKind::Validation.code());
        assert_eq!(body["error"]["context"]["retryable"], false);
    }
}
