//! Session endpoints for the dashboard frontend
//!
//! Endpoints:
//! - POST /session/login  (email + password, starts a session)
//! - POST /session/logout (best-effort server logout, local clear)
//! - GET  /session        (login state, expiry and channel state)
//!
//! Tokens never leave the relay. The channel follows the session on its own:
//! it re-authenticates when the stored token rotates and drops to
//! `Disconnected` when the credential is cleared, so login only has to
//! (re)open it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::Secret;
use realtime_channel::ReconnectingChannel;
use request_pipeline::RequestPipeline;
use serde::Deserialize;
use tracing::info;
use transport::ErrorKind;

use crate::error::RelayError;

/// Shared state for session handlers.
#[derive(Clone)]
pub struct SessionState {
    pub pipeline: RequestPipeline,
    pub channel: ReconnectingChannel,
}

/// Build the session router.
pub fn router(state: SessionState) -> Router {
    Router::new()
        .route("/session", get(session_status))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .with_state(state)
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: Secret<String>,
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn json_ok(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn status_body(state: &SessionState) -> serde_json::Value {
    let credential = state.pipeline.store().get();
    serde_json::json!({
        "logged_in": credential.as_ref().is_some_and(|c| c.has_access_token() || c.has_refresh_token()),
        "expires_at": credential.as_ref().and_then(|c| c.expires_at),
        "channel": state.channel.state().label(),
    })
}

/// GET /session
async fn session_status(State(state): State<SessionState>) -> Response {
    json_ok(status_body(&state))
}

/// POST /session/login
///
/// On success the channel is opened with the new access token. A channel
/// that is already up picks the rotation up by itself.
async fn login(
    State(state): State<SessionState>,
    payload: Result<Json<LoginRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let request_id = request_id();
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            return RelayError::local(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                rejection.body_text(),
                request_id,
            )
            .into_response();
        }
    };

    match state.pipeline.login(&body.email, &body.password).await {
        Ok(credential) => {
            state.channel.connect(Some(credential)).await;
            info!(request_id, "session started");
            json_ok(status_body(&state))
        }
        Err(error) => RelayError::new(error, request_id).into_response(),
    }
}

/// POST /session/logout
async fn logout(State(state): State<SessionState>) -> Response {
    state.pipeline.logout().await;
    json_ok(status_body(&state))
}
