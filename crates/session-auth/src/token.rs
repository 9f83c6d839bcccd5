//! Auth endpoint calls: refresh, login and logout
//!
//! All three POST to the dashboard API through an `HttpTransport`, so the
//! mock transport can answer them in tests and in mock mode. Refresh and
//! login answer with the same token shape, either bare or wrapped in the
//! success envelope's `data`.

use std::time::Duration;

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use transport::{Envelope, HttpRequest, HttpResponse, HttpTransport, RawFailure, classify};

use crate::constants::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::credentials::{Credential, now_millis};
use crate::error::{Error, Result};

/// Token pair returned by refresh and login.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Convert into a stored credential, anchoring `expires_in` at `now_ms`.
    pub fn into_credential_at(self, now_ms: u64) -> Credential {
        let expires_at = self
            .expires_in
            .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000)));
        Credential::new(self.access_token, self.refresh_token, expires_at)
    }

    pub fn into_credential(self) -> Credential {
        self.into_credential_at(now_millis())
    }
}

/// `Authorization: Bearer <token>` value, marked sensitive so it is never
/// printed by header debug output. `None` when the token is empty or not a
/// valid header value.
pub fn bearer_header(token: &Secret<String>) -> Option<HeaderValue> {
    if token.is_empty() {
        return None;
    }
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str())).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// Exchange a refresh token for a new credential pair.
///
/// Any non-2xx answer is a refresh failure; 401/403 mean the refresh token
/// is revoked or expired (`Error::is_rejected`).
pub async fn refresh_token(
    transport: &dyn HttpTransport,
    refresh: &Secret<String>,
    timeout: Duration,
) -> Result<TokenResponse> {
    let request = HttpRequest::post(REFRESH_PATH)
        .json(&serde_json::json!({ "refresh_token": refresh.as_str() }))
        .with_timeout(timeout);
    let response = send(transport, request).await?;
    parse_token_response(&response)
}

/// Password login.
pub async fn login(
    transport: &dyn HttpTransport,
    email: &str,
    password: &Secret<String>,
    timeout: Duration,
) -> Result<TokenResponse> {
    let request = HttpRequest::post(LOGIN_PATH)
        .json(&serde_json::json!({ "email": email, "password": password.as_str() }))
        .with_timeout(timeout);
    let response = send(transport, request).await?;
    parse_token_response(&response)
}

/// Tell the server the session is over. Failures are returned for logging;
/// callers clear local state regardless.
pub async fn logout(
    transport: &dyn HttpTransport,
    access: Option<&Secret<String>>,
    timeout: Duration,
) -> Result<()> {
    let mut request = HttpRequest::post(LOGOUT_PATH).with_timeout(timeout);
    if let Some(value) = access.and_then(bearer_header) {
        request = request.with_header(AUTHORIZATION, value);
    }
    send(transport, request).await?;
    Ok(())
}

/// Dispatch under the request's deadline and lift non-2xx into a classified
/// error.
async fn send(transport: &dyn HttpTransport, request: HttpRequest) -> Result<HttpResponse> {
    let path = request.route().to_string();
    let deadline = request.timeout;
    let outcome = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, transport.call(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RawFailure::Timeout(deadline)),
        },
        None => transport.call(request).await,
    };

    let response = outcome.map_err(|raw| {
        let error = classify(&raw);
        warn!(path = %path, error = %error, "auth endpoint unreachable");
        Error::Api(error)
    })?;

    if !response.is_success() {
        let error = classify(&RawFailure::from_response(&response));
        warn!(path = %path, status = response.status, error = %error, "auth endpoint refused");
        return Err(Error::Api(error));
    }
    debug!(path = %path, status = response.status, "auth endpoint answered");
    Ok(response)
}

/// Accept `{access_token, ...}` or `{success, data: {access_token, ...}}`.
fn parse_token_response(response: &HttpResponse) -> Result<TokenResponse> {
    let value: serde_json::Value = response.decode()?;
    if value.get("success").is_some() {
        let envelope: Envelope<TokenResponse> = serde_json::from_value(value)
            .map_err(|e| Error::InvalidResponse(format!("malformed token envelope: {e}")))?;
        return envelope
            .into_data(response.status)
            .map_err(Error::Api)?
            .ok_or_else(|| Error::InvalidResponse("token envelope carried no data".into()));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::InvalidResponse(format!("malformed token response: {e}")))
}
