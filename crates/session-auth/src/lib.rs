//! Session credential management for the dashboard transport core
//!
//! Owns the credential pair and its lifecycle: the `TokenStore` every other
//! component reads from, the credential file that survives restarts, and the
//! refresh/login/logout calls against the dashboard API. This crate has no
//! knowledge of request queuing; coordinated refresh lives in the request
//! pipeline, which other components reach through `CredentialRefresher`.
//!
//! Credential flow:
//! 1. `TokenStore::load()` restores the last credential from disk
//! 2. `token::login()` or a seeded refresh token starts a session
//! 3. The pipeline calls `token::refresh_token()` when a request gets a 401
//! 4. `TokenStore::set()` publishes the new pair to every observer
//! 5. `TokenStore::clear()` on logout or refresh failure ends the session

pub mod constants;
pub mod credentials;
pub mod error;
pub mod store;
pub mod token;

pub use constants::*;
pub use credentials::{Credential, CredentialFile, now_millis};
pub use error::{Error, Result};
pub use store::TokenStore;
pub use token::{TokenResponse, bearer_header, login, logout, refresh_token};

use transport::{ApiError, BoxFuture};

/// Entry point into the single-flight refresh path.
///
/// Implemented by the request pipeline. The realtime channel and the
/// background refresh task hold it as `Arc<dyn CredentialRefresher>` so a
/// refresh they trigger joins any refresh already in flight instead of
/// racing it.
pub trait CredentialRefresher: Send + Sync {
    /// Refresh the stored credential, or wait for the in-flight refresh, and
    /// return the resulting credential.
    fn refresh_credential(&self) -> BoxFuture<'_, std::result::Result<Credential, ApiError>>;
}
