//! In-memory HTTP transport with canned responses
//!
//! Answers from a route table after a synthetic latency and records every
//! call in dispatch order. The relay uses `MockHttpTransport::canned()` in
//! mock mode; tests install their own routes to script 401s, refresh
//! outcomes and slow endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Method;
use tracing::debug;

use crate::envelope::error_envelope;
use crate::request::{HttpRequest, HttpResponse, RawFailure};
use crate::{BoxFuture, HttpTransport};

/// Route handler: inspects the request and produces a response or failure.
pub type MockHandler = Arc<dyn Fn(&HttpRequest) -> Result<HttpResponse, RawFailure> + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    latency: Option<Duration>,
    handler: MockHandler,
}

/// A call as the mock saw it at dispatch time.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    /// Bearer token the call carried, if any
    pub bearer: Option<String>,
}

/// Route-table transport with synthetic latency.
pub struct MockHttpTransport {
    latency: Duration,
    /// Unknown routes answer 404 when strict, an empty success otherwise
    strict: bool,
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockHttpTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            strict: true,
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Install (or replace) a handler for `method path`.
    pub fn route<F>(&self, method: Method, path: &str, handler: F) -> &Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, RawFailure> + Send + Sync + 'static,
    {
        self.insert_route(method, path, None, Arc::new(handler))
    }

    /// Install a handler with its own latency instead of the transport default.
    pub fn route_with_latency<F>(
        &self,
        method: Method,
        path: &str,
        latency: Duration,
        handler: F,
    ) -> &Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, RawFailure> + Send + Sync + 'static,
    {
        self.insert_route(method, path, Some(latency), Arc::new(handler))
    }

    fn insert_route(
        &self,
        method: Method,
        path: &str,
        latency: Option<Duration>,
        handler: MockHandler,
    ) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|r| !(r.method == method && r.path == path));
        routes.push(Route {
            method,
            path: path.to_string(),
            latency,
            handler,
        });
        self
    }

    /// Snapshot of all calls in dispatch order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls dispatched to a path.
    pub fn call_count(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.path == path)
            .count()
    }

    /// Mock-mode backend for running the relay without an API server.
    ///
    /// Login and refresh mint sequential tokens; logout succeeds; every other
    /// route answers with an empty success envelope.
    pub fn canned(latency: Duration) -> Self {
        let mut transport = Self::new(latency);
        transport.strict = false;
        let counter = Arc::new(AtomicU64::new(0));

        let mint = move |_: &HttpRequest| -> Result<HttpResponse, RawFailure> {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(HttpResponse::json(
                200,
                &serde_json::json!({
                    "success": true,
                    "data": {
                        "access_token": format!("mock_at_{n}"),
                        "refresh_token": format!("mock_rt_{n}"),
                        "expires_in": 900,
                    }
                }),
            ))
        };
        let mint = Arc::new(mint);
        let login = mint.clone();
        transport.route(Method::POST, "/auth/login", move |r| login(r));
        transport.route(Method::POST, "/auth/refresh", move |r| mint(r));
        transport.route(Method::POST, "/auth/logout", |_| {
            Ok(HttpResponse::json(200, &serde_json::json!({"success": true, "data": null})))
        });
        transport
    }

    fn lookup(&self, request: &HttpRequest) -> Option<(Option<Duration>, MockHandler)> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .find(|r| r.method == request.method && r.path == request.route())
            .map(|r| (r.latency, r.handler.clone()))
    }
}

impl HttpTransport for MockHttpTransport {
    fn id(&self) -> &str {
        "mock"
    }

    fn call(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RawFailure>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RecordedCall {
                    method: request.method.clone(),
                    path: request.route().to_string(),
                    bearer: request.bearer().map(str::to_string),
                });

            let route = self.lookup(&request);
            let latency = route
                .as_ref()
                .and_then(|(latency, _)| *latency)
                .unwrap_or(self.latency);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            debug!(method = %request.method, path = %request.path, "mock transport answering");
            match route {
                Some((_, handler)) => handler(&request),
                None if self.strict => Ok(HttpResponse::json(
                    404,
                    &error_envelope(
                        "NOT_FOUND",
                        &format!("no mock route for {}", request.route()),
                        serde_json::json!({}),
                    ),
                )),
                None => Ok(HttpResponse::json(
                    200,
                    &serde_json::json!({"success": true, "data": null, "message": null}),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn routes_answer_after_latency() {
        let transport = MockHttpTransport::new(Duration::from_millis(250));
        transport.route(Method::GET, "/api/contests", |_| {
            Ok(HttpResponse::json(200, &serde_json::json!({"success": true, "data": []})))
        });

        let started = tokio::time::Instant::now();
        let response = transport
            .call(HttpRequest::get("/api/contests?page=1"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn unknown_route_is_404_when_strict() {
        let transport = MockHttpTransport::new(Duration::ZERO);
        let response = transport.call(HttpRequest::get("/missing")).await.unwrap();
        assert_eq!(response.status, 404);
        let body: serde_json::Value = response.decode().unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn records_calls_in_dispatch_order_with_bearer() {
        use reqwest::header::{AUTHORIZATION, HeaderValue};

        let transport = MockHttpTransport::new(Duration::ZERO);
        transport
            .call(
                HttpRequest::get("/a")
                    .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer at_1")),
            )
            .await
            .unwrap();
        transport.call(HttpRequest::get("/b")).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].path, "/a");
        assert_eq!(calls[0].bearer.as_deref(), Some("at_1"));
        assert_eq!(calls[1].path, "/b");
        assert_eq!(calls[1].bearer, None);
        assert_eq!(transport.call_count("/a"), 1);
    }

    #[tokio::test]
    async fn route_replaces_existing_handler() {
        let transport = MockHttpTransport::new(Duration::ZERO);
        transport.route(Method::GET, "/x", |_| Ok(HttpResponse::new(500, "")));
        transport.route(Method::GET, "/x", |_| Ok(HttpResponse::new(204, "")));
        let response = transport.call(HttpRequest::get("/x")).await.unwrap();
        assert_eq!(response.status, 204);
    }

    #[tokio::test]
    async fn canned_backend_mints_sequential_tokens() {
        let transport = MockHttpTransport::canned(Duration::ZERO);
        let first = transport
            .call(HttpRequest::post("/auth/refresh"))
            .await
            .unwrap();
        let second = transport
            .call(HttpRequest::post("/auth/refresh"))
            .await
            .unwrap();
        let first: serde_json::Value = first.decode().unwrap();
        let second: serde_json::Value = second.decode().unwrap();
        assert_eq!(first["data"]["access_token"], "mock_at_1");
        assert_eq!(second["data"]["access_token"], "mock_at_2");

        let other = transport.call(HttpRequest::get("/api/users")).await.unwrap();
        assert_eq!(other.status, 200);
    }

    #[tokio::test]
    async fn handler_can_fail_with_network_error() {
        let transport = MockHttpTransport::new(Duration::ZERO);
        transport.route(Method::GET, "/down", |_| {
            Err(RawFailure::Network("connection reset".into()))
        });
        let result = transport.call(HttpRequest::get("/down")).await;
        assert_eq!(result.unwrap_err(), RawFailure::Network("connection reset".into()));
    }
}
