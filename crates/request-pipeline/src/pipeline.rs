//! Authenticated request execution with single-flight token refresh
//!
//! Every outbound call goes through `RequestPipeline::execute`, which attaches
//! the current bearer token, dispatches under a deadline and classifies
//! failures. A 401 is the one failure recovered locally: the first caller to
//! see it starts a refresh, every later caller queues behind it, and once the
//! refresh settles the queue is replayed (or rejected) in submission order.
//!
//! Refresh state is a flag plus a FIFO queue behind a `std::sync::Mutex`
//! that is never held across an await. The refresh itself runs on its own
//! task, so a caller dropping its future cannot strand the callers queued
//! behind it.
//!
//! Refresh lifecycle:
//! 1. A 401 arrives for a request that carried the current token
//! 2. No refresh in flight → set the flag, spawn the refresh task
//! 3. Refresh in flight → enqueue a `Waiter` and await its reply
//! 4. Success → store the credential, replay the queue FIFO, then the trigger
//! 5. Failure → clear the store, reject everyone, emit one `Expired`

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::Secret;
use futures_util::future::join_all;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use session_auth::{Credential, CredentialRefresher, TokenStore, bearer_header};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use transport::{
    ApiError, BoxFuture, Envelope, ErrorKind, HttpRequest, HttpResponse, HttpTransport,
    RawFailure, classify,
};

/// Session-level signals for observers outside the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A refresh succeeded and the store holds a new credential
    Refreshed,
    /// A refresh failed; the store was cleared and the user must log in again
    Expired,
}

/// Pipeline timing knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Deadline for a request that sets none of its own
    pub request_timeout: Duration,
    /// Deadline for refresh, login and logout calls
    pub auth_timeout: Duration,
    /// Refresh before dispatch when the access token expires within this window
    pub refresh_skew: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_millis(session_auth::DEFAULT_AUTH_TIMEOUT_MS),
            refresh_skew: Duration::from_secs(60),
        }
    }
}

/// A caller blocked behind an in-flight refresh.
enum Waiter {
    /// Replay this request with the new token and hand back its outcome
    Replay {
        request: HttpRequest,
        reply: oneshot::Sender<Result<HttpResponse, ApiError>>,
    },
    /// Hand back the refreshed credential itself
    Credential {
        reply: oneshot::Sender<Result<Credential, ApiError>>,
    },
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    queue: VecDeque<Waiter>,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    store: Arc<TokenStore>,
    config: PipelineConfig,
    refresh: Mutex<RefreshState>,
    session_tx: broadcast::Sender<SessionEvent>,
}

/// Authenticated HTTP pipeline. Cheap to clone; clones share refresh state.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Inner>,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<TokenStore>,
        config: PipelineConfig,
    ) -> Self {
        let (session_tx, _) = broadcast::channel(16);
        info!(
            transport = transport.id(),
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            refresh_skew_secs = config.refresh_skew.as_secs(),
            "request pipeline initialized"
        );
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                config,
                refresh: Mutex::new(RefreshState::default()),
                session_tx,
            }),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.inner.store
    }

    pub fn transport_id(&self) -> &str {
        self.inner.transport.id()
    }

    /// Session signals (`Refreshed`, `Expired`).
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_tx.subscribe()
    }

    /// Whether a refresh is currently in flight.
    pub fn refresh_in_progress(&self) -> bool {
        self.inner.state().in_progress
    }

    /// Execute a request with the current credential.
    ///
    /// Returns the response for any 2xx status. Every other outcome is a
    /// classified `ApiError`; only a 401 is retried, once, through the
    /// refresh path.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.refresh_if_expiring(&request).await?;

        let used = self.inner.store.access_token();
        match self.inner.dispatch(&request, used.as_ref()).await {
            Err(error) if error.is_unauthorized() => {
                self.recover_unauthorized(request, used, error).await
            }
            outcome => outcome,
        }
    }

    /// Forward a request on behalf of a downstream client.
    ///
    /// Same credential handling as `execute`, but any response that reached
    /// the client is handed back as-is so it can be relayed verbatim. A 401
    /// still goes through refresh-and-replay; the replay outcome is classified
    /// like `execute`.
    pub async fn forward(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.refresh_if_expiring(&request).await?;

        let used = self.inner.store.access_token();
        let response = self.inner.send(&request, used.as_ref()).await?;
        if response.status != 401 {
            return Ok(response);
        }
        let rejected = classify(&RawFailure::from_response(&response));
        self.recover_unauthorized(request, used, rejected).await
    }

    /// Execute and unwrap the response envelope's `data`.
    ///
    /// `success: false` bodies become typed errors. A `null` or absent `data`
    /// decodes as JSON `null`, so `T = Option<_>` or `()` accept it.
    pub async fn execute_envelope<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
    ) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        let envelope: Envelope<T> = response.decode()?;
        match envelope.into_data(response.status)? {
            Some(data) => Ok(data),
            None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                ApiError::new(ErrorKind::Unknown, "response envelope carried no data")
                    .with_status(response.status)
            }),
        }
    }

    /// Refresh the credential, joining the in-flight refresh when there is one.
    ///
    /// Without a stored refresh token this fails with `Unauthorized` and
    /// emits no session signal: there is no session to expire.
    pub async fn refresh(&self) -> Result<Credential, ApiError> {
        let (reply, rx) = oneshot::channel();
        if self.inner.submit(Waiter::Credential { reply }).is_err() {
            return Err(ApiError::unauthorized("no refresh token stored, login required"));
        }
        rx.await
            .unwrap_or_else(|_| Err(ApiError::unauthorized("refresh ended without settling")))
    }

    /// Password login; stores the new credential.
    pub async fn login(&self, email: &str, password: &Secret<String>) -> Result<Credential, ApiError> {
        let response = session_auth::login(
            self.inner.transport.as_ref(),
            email,
            password,
            self.inner.config.auth_timeout,
        )
        .await?;
        let credential = response.into_credential();
        if let Err(e) = self.inner.store.set(credential.clone()).await {
            warn!(error = %e, "failed to persist login credential");
        }
        info!(expires_at = ?credential.expires_at, "logged in");
        Ok(credential)
    }

    /// Best-effort server logout, then clear the local credential regardless.
    pub async fn logout(&self) {
        let access = self.inner.store.access_token();
        if let Err(e) = session_auth::logout(
            self.inner.transport.as_ref(),
            access.as_ref(),
            self.inner.config.auth_timeout,
        )
        .await
        {
            warn!(error = %e, "server logout failed, clearing local session anyway");
        }
        if let Err(e) = self.inner.store.clear().await {
            warn!(error = %e, "failed to remove persisted credential");
        }
        info!("logged out");
    }

    async fn refresh_if_expiring(&self, request: &HttpRequest) -> Result<(), ApiError> {
        let expiring = self.inner.store.get().is_some_and(|c| {
            c.has_refresh_token() && c.expires_within(self.inner.config.refresh_skew)
        });
        if expiring {
            debug!(route = request.route(), "credential expiring, refreshing before dispatch");
            self.refresh().await?;
        }
        Ok(())
    }

    async fn recover_unauthorized(
        &self,
        request: HttpRequest,
        used: Option<Secret<String>>,
        original: ApiError,
    ) -> Result<HttpResponse, ApiError> {
        let current = self.inner.store.access_token();
        if current.is_some() && current != used {
            debug!(route = request.route(), "token rotated since dispatch, replaying");
            return self.inner.dispatch(&request, current.as_ref()).await;
        }

        let (reply, rx) = oneshot::channel();
        if let Err(Waiter::Replay { request, .. }) =
            self.inner.submit(Waiter::Replay { request, reply })
        {
            debug!(route = request.route(), "401 without a refresh token");
            return Err(original);
        }
        rx.await
            .unwrap_or_else(|_| Err(ApiError::unauthorized("refresh ended without settling")))
    }
}

impl CredentialRefresher for RequestPipeline {
    fn refresh_credential(&self) -> BoxFuture<'_, Result<Credential, ApiError>> {
        Box::pin(self.refresh())
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue behind the in-flight refresh, or start one with this waiter as
    /// its trigger. Hands the waiter back when no refresh token is stored.
    ///
    /// The token check shares the flag's lock; a failed refresh clears the
    /// store before it drops the flag.
    fn submit(self: &Arc<Self>, waiter: Waiter) -> Result<(), Waiter> {
        {
            let mut state = self.state();
            if state.in_progress {
                state.queue.push_back(waiter);
                metrics::counter!("pipeline_queued_calls_total").increment(1);
                debug!(queued = state.queue.len(), "queued behind in-flight refresh");
                return Ok(());
            }
            if !self.store.can_refresh() {
                return Err(waiter);
            }
            state.in_progress = true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_refresh(waiter).await });
        Ok(())
    }

    async fn run_refresh(self: Arc<Self>, trigger: Waiter) {
        match self.perform_refresh().await {
            Ok(credential) => {
                metrics::counter!("pipeline_refresh_total", "outcome" => "success").increment(1);
                info!(expires_at = ?credential.expires_at, "token refresh succeeded");
                let _ = self.session_tx.send(SessionEvent::Refreshed);

                let queued = self.take_queue();
                self.settle_all(queued, &credential).await;
                self.settle(trigger, &credential).await;

                // Callers that queued while we were replaying
                loop {
                    let late = {
                        let mut state = self.state();
                        if state.queue.is_empty() {
                            state.in_progress = false;
                            break;
                        }
                        std::mem::take(&mut state.queue)
                    };
                    self.settle_all(late, &credential).await;
                }
            }
            Err(error) => {
                metrics::counter!("pipeline_refresh_total", "outcome" => "failure").increment(1);
                warn!(error = %error, "token refresh failed, session expired");

                // Clear while still flagged so late 401s queue instead of
                // starting a second refresh with the revoked token
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "failed to remove persisted credential");
                }
                let queued = {
                    let mut state = self.state();
                    state.in_progress = false;
                    std::mem::take(&mut state.queue)
                };
                let _ = self.session_tx.send(SessionEvent::Expired);

                let rejection = ApiError::unauthorized(format!("session expired: {}", error.message));
                for waiter in queued.into_iter().chain(std::iter::once(trigger)) {
                    reject(waiter, rejection.clone());
                }
            }
        }
    }

    fn take_queue(&self) -> VecDeque<Waiter> {
        std::mem::take(&mut self.state().queue)
    }

    async fn perform_refresh(&self) -> Result<Credential, ApiError> {
        let Some(current) = self.store.get().filter(Credential::has_refresh_token) else {
            return Err(ApiError::unauthorized("no refresh token stored"));
        };
        let response = session_auth::refresh_token(
            self.transport.as_ref(),
            &current.refresh_token,
            self.config.auth_timeout,
        )
        .await?;
        let credential = response.into_credential();
        if let Err(e) = self.store.set(credential.clone()).await {
            warn!(error = %e, "failed to persist refreshed credential");
        }
        Ok(credential)
    }

    /// Replay a batch. Dispatch starts in queue order; completions may
    /// interleave.
    async fn settle_all(&self, waiters: VecDeque<Waiter>, credential: &Credential) {
        if waiters.is_empty() {
            return;
        }
        debug!(count = waiters.len(), "replaying queued calls");
        join_all(waiters.into_iter().map(|w| self.settle(w, credential))).await;
    }

    async fn settle(&self, waiter: Waiter, credential: &Credential) {
        match waiter {
            Waiter::Replay { request, reply } => {
                let outcome = self
                    .dispatch(&request, Some(&credential.access_token))
                    .await;
                let _ = reply.send(outcome);
            }
            Waiter::Credential { reply } => {
                let _ = reply.send(Ok(credential.clone()));
            }
        }
    }

    /// One attempt: attach the token, dispatch under the deadline, classify
    /// anything but a 2xx.
    async fn dispatch(
        &self,
        request: &HttpRequest,
        token: Option<&Secret<String>>,
    ) -> Result<HttpResponse, ApiError> {
        let error = match self.send(request, token).await {
            Ok(response) if response.is_success() => return Ok(response),
            Ok(response) => classify(&RawFailure::from_response(&response)),
            Err(error) => error,
        };
        debug!(
            method = %request.method,
            route = request.route(),
            kind = %error.kind,
            status = ?error.status,
            "request failed"
        );
        Err(error)
    }

    /// Attach the token and dispatch under the deadline. Any response that
    /// arrived is `Ok`; only local failures are classified here.
    async fn send(
        &self,
        request: &HttpRequest,
        token: Option<&Secret<String>>,
    ) -> Result<HttpResponse, ApiError> {
        let mut outbound = request.clone();
        outbound.headers.remove(AUTHORIZATION);
        if let Some(value) = token.and_then(bearer_header) {
            outbound.headers.insert(AUTHORIZATION, value);
        }

        let deadline = request.timeout.unwrap_or(self.config.request_timeout);
        outbound.timeout = Some(deadline);

        match tokio::time::timeout(deadline, self.transport.call(outbound)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(raw)) => Err(classify(&raw)),
            Err(_) => Err(classify(&RawFailure::Timeout(deadline))),
        }
    }
}

fn reject(waiter: Waiter, error: ApiError) {
    match waiter {
        Waiter::Replay { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Waiter::Credential { reply } => {
            let _ = reply.send(Err(error));
        }
    }
}
