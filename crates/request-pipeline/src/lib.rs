//! Authenticated request pipeline for the dashboard API
//!
//! Executes outbound calls through the session `TokenStore` and the shared
//! error classifier, and owns the single-flight refresh that keeps callers
//! alive across access-token expiry. The realtime channel and the background
//! refresh task reach the same refresh path through `CredentialRefresher`.
//!
//! Request lifecycle:
//! 1. Credential about to expire → refresh before dispatch
//! 2. Attach `Authorization: Bearer` and dispatch under the request deadline
//! 3. 2xx → response; any other failure → classified `ApiError`
//!    (`forward` hands non-2xx responses back as-is for proxies)
//! 4. 401 → one coordinated refresh, then a single replay
//! 5. Refresh failure → store cleared, `SessionEvent::Expired` emitted

pub mod pipeline;
pub mod refresh;

pub use pipeline::{PipelineConfig, RequestPipeline, SessionEvent};
pub use refresh::spawn_refresh_task;
