//! Live HTTP transport backed by reqwest
//!
//! Joins the request path onto the configured API base URL and forwards the
//! method, headers and body unchanged. Any response that arrives is returned
//! as-is; only connection-level failures and elapsed deadlines become
//! `RawFailure`s.

use std::time::Duration;

use tracing::debug;

use crate::request::{HttpRequest, HttpResponse, RawFailure};
use crate::{BoxFuture, HttpTransport};

/// Real I/O transport for the dashboard API.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Absolute URL for a request path.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn id(&self) -> &str {
        "reqwest"
    }

    fn call(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RawFailure>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);
            debug!(method = %request.method, url = %url, "dispatching request");

            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers.clone())
                .body(request.body.clone());
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    RawFailure::Timeout(request.timeout.unwrap_or(Duration::ZERO))
                } else {
                    RawFailure::Network(format!("request to {url} failed: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| RawFailure::Network(format!("reading response body: {e}")))?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use reqwest::header::{AUTHORIZATION, HeaderValue};
    use tokio::net::TcpListener;

    /// Start an upstream that echoes method, path and authorization as JSON.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app =
                axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                    let authorization = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = serde_json::json!({
                        "method": request.method().to_string(),
                        "path": request.uri().path(),
                        "authorization": authorization,
                    });
                    (StatusCode::OK, axum::Json(body))
                });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    #[test]
    fn url_for_joins_without_double_slash() {
        let transport = ReqwestTransport::new(reqwest::Client::new(), "http://api.local/");
        assert_eq!(transport.url_for("/api/votes"), "http://api.local/api/votes");
        assert_eq!(transport.url_for("api/votes"), "http://api.local/api/votes");
    }

    #[tokio::test]
    async fn forwards_method_path_and_headers() {
        let (url, _server) = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new(), url);

        let request = HttpRequest::post("/api/contests")
            .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer at_1"));
        let response = transport.call(request).await.unwrap();

        assert_eq!(response.status, 200);
        let json: serde_json::Value = response.decode().unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/api/contests");
        assert_eq!(json["authorization"], "Bearer at_1");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_network_failure() {
        let transport = ReqwestTransport::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let result = transport.call(HttpRequest::get("/api/users")).await;
        assert!(matches!(result, Err(RawFailure::Network(_))));
    }
}
