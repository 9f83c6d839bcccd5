//! HTTP transport abstraction for the dashboard API
//!
//! Defines the `HttpTransport` trait the request pipeline dispatches through,
//! the request/response value types that cross it, and the shared error
//! classifier both the HTTP pipeline and the realtime channel use so callers
//! see one error shape regardless of which transport failed.
//!
//! Two implementations ship here and are selected once at construction:
//! - `ReqwestTransport` performs real I/O against the API base URL
//! - `MockHttpTransport` answers from a route table with synthetic latency

pub mod classify;
pub mod envelope;
pub mod mock;
pub mod reqwest_transport;
mod request;

pub use classify::{
    ApiError, ErrorKind, SERVER_DISCONNECT_REASON, classify, classify_disconnect,
    classify_status, is_server_disconnect,
};
pub use envelope::{Envelope, ErrorBody, error_envelope};
pub use mock::{MockHttpTransport, RecordedCall};
pub use request::{HttpRequest, HttpResponse, RawFailure};
pub use reqwest_transport::ReqwestTransport;

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future used at the dyn-compatible trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability set of an outbound HTTP transport.
///
/// A transport only moves bytes: it returns `Ok` for every response that
/// reached the client, whatever its status, and `Err(RawFailure)` when no
/// response arrived. Authorization, classification and retry policy belong to
/// the pipeline layered on top.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn HttpTransport>`).
pub trait HttpTransport: Send + Sync {
    /// Identifier for logging (e.g. "reqwest", "mock")
    fn id(&self) -> &str;

    /// Dispatch a single request and wait for its response.
    fn call(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RawFailure>>;
}
