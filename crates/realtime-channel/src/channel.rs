//! Reconnecting realtime channel
//!
//! `ReconnectingChannel` is a handle to a single actor task. The actor owns
//! the state machine state, the live link (if any), the backoff timer and the
//! subscription registry; every mutation happens on that task, so reconnect
//! attempts are strictly sequential and `disconnect()` cancels a pending
//! timer atomically. Handle methods send a command and wait for its ack.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde_json::Value;
use session_auth::{Credential, CredentialRefresher, TokenStore};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};
use transport::{ApiError, BoxFuture};

use crate::machine::{
    BackoffPolicy, ChannelAction, ChannelEvent, ChannelNotice, ChannelState, ConnectionState,
    handle_event,
};
use crate::registry::{EventHandler, Registry};
use crate::link::{
    ChannelLink, ChannelSignal, ChannelTransport, Handshake, OutboundFrame, TRANSPORT_CLOSE_REASON,
};

const COMMAND_BUFFER: usize = 32;
const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub backoff: BackoffPolicy,
    /// An open that has not completed by then counts as a transport error
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

enum Command {
    Connect {
        credential: Option<Credential>,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        event: String,
        handler: EventHandler,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        event: String,
        ack: oneshot::Sender<bool>,
    },
    Emit {
        event: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
}

#[derive(Clone)]
pub struct ReconnectingChannel {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<ChannelNotice>,
}

impl ReconnectingChannel {
    /// Spawn the channel actor. Starts `Disconnected`; nothing is opened
    /// until `connect()`.
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        store: Arc<TokenStore>,
        refresher: Arc<dyn CredentialRefresher>,
        config: ChannelConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let token_rx = store.subscribe();
        let actor = Actor {
            last_token: store.access_token(),
            transport,
            store,
            refresher,
            config,
            state: ChannelState::Disconnected,
            phase: Phase::Idle,
            registry: Registry::new(),
            handshake_override: None,
            state_tx,
            notices: notices.clone(),
        };
        tokio::spawn(actor.run(command_rx, token_rx));

        Self {
            commands,
            state,
            notices,
        }
    }

    /// Open the channel. `credential` overrides the stored access token for
    /// this handshake only. No-op unless `Disconnected` or `Failed`.
    pub async fn connect(&self, credential: Option<Credential>) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Connect { credential, ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Close the channel and cancel any pending reconnect. Once this
    /// returns, nothing reconnects until the next `connect()`.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Register `handler` for `event`, replacing any previous handler.
    /// Armed on the live connection immediately when connected, and on
    /// every later connection.
    pub async fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let (ack, done) = oneshot::channel();
        let command = Command::Subscribe {
            event: event.to_string(),
            handler: Arc::new(handler),
            ack,
        };
        if self.commands.send(command).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Returns `true` when a subscription was removed.
    pub async fn unsubscribe(&self, event: &str) -> bool {
        let (ack, done) = oneshot::channel();
        let command = Command::Unsubscribe {
            event: event.to_string(),
            ack,
        };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Send an application event on the live connection.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<(), ApiError> {
        let (reply, done) = oneshot::channel();
        let command = Command::Emit {
            event: event.to_string(),
            payload,
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return Err(ApiError::socket("channel closed"));
        }
        done.await
            .unwrap_or_else(|_| Err(ApiError::socket("channel closed")))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }
}

/// What the actor is currently waiting on besides commands.
enum Phase {
    Idle,
    Opening(BoxFuture<'static, Result<ChannelLink, ApiError>>),
    Live(ChannelLink),
    Backoff(Pin<Box<Sleep>>),
    Refreshing(BoxFuture<'static, Result<Credential, ApiError>>),
}

enum Wake {
    Opened(Result<ChannelLink, ApiError>),
    Signal(Option<ChannelSignal>),
    Timer,
    Refreshed(Result<Credential, ApiError>),
}

/// Resolve when the current phase produces something. Cancel-safe: the
/// phase keeps its future when this is dropped.
async fn wait_phase(phase: &mut Phase) -> Wake {
    match phase {
        Phase::Idle => std::future::pending().await,
        Phase::Opening(open) => Wake::Opened(open.await),
        Phase::Live(link) => Wake::Signal(link.signals.recv().await),
        Phase::Backoff(sleep) => {
            sleep.as_mut().await;
            Wake::Timer
        }
        Phase::Refreshing(refresh) => Wake::Refreshed(refresh.await),
    }
}

struct Actor {
    transport: Arc<dyn ChannelTransport>,
    store: Arc<TokenStore>,
    refresher: Arc<dyn CredentialRefresher>,
    config: ChannelConfig,
    state: ChannelState,
    phase: Phase,
    registry: Registry,
    /// Token for the next handshake only, from `connect(Some(..))`
    handshake_override: Option<Secret<String>>,
    /// Last access token observed in the store
    last_token: Option<Secret<String>>,
    state_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<ChannelNotice>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut token_rx: watch::Receiver<Option<Credential>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                wake = wait_phase(&mut self.phase) => {
                    if let Some(event) = self.on_wake(wake) {
                        self.process(event).await;
                    }
                }
                Ok(()) = token_rx.changed() => {
                    let current = token_rx.borrow_and_update().clone();
                    if let Some(event) = self.on_credential(current) {
                        self.process(event).await;
                    }
                }
            }
        }
        debug!("channel handles dropped, stopping");
        self.close_link().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { credential, ack } => {
                self.handshake_override = credential
                    .filter(Credential::has_access_token)
                    .map(|c| c.access_token);
                self.process(ChannelEvent::ConnectRequested).await;
                self.handshake_override = None;
                let _ = ack.send(());
            }
            Command::Disconnect { ack } => {
                self.process(ChannelEvent::DisconnectRequested).await;
                let _ = ack.send(());
            }
            Command::Subscribe {
                event,
                handler,
                ack,
            } => {
                let added = self.registry.upsert(&event, handler);
                debug!(event = %event, added, "subscription registered");
                if added {
                    if let Some(failure) = self.send_live(OutboundFrame::Subscribe { event }).await {
                        self.process(failure).await;
                    }
                }
                let _ = ack.send(());
            }
            Command::Unsubscribe { event, ack } => {
                let removed = self.registry.remove(&event);
                if removed {
                    if let Some(failure) = self.send_live(OutboundFrame::Unsubscribe { event }).await {
                        self.process(failure).await;
                    }
                }
                let _ = ack.send(removed);
            }
            Command::Emit {
                event,
                payload,
                reply,
            } => {
                let result = match (&self.state, &mut self.phase) {
                    (ChannelState::Connected, Phase::Live(link)) => {
                        link.sink.send(OutboundFrame::Emit { event, payload }).await
                    }
                    _ => Err(ApiError::socket("channel not connected")),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Send on the live link when connected. A failed send is reported as
    /// the follow-up event; not being connected is not a failure.
    async fn send_live(&mut self, frame: OutboundFrame) -> Option<ChannelEvent> {
        let (ChannelState::Connected, Phase::Live(link)) = (&self.state, &mut self.phase) else {
            return None;
        };
        match link.sink.send(frame).await {
            Ok(()) => None,
            Err(e) => Some(ChannelEvent::TransportError { message: e.message }),
        }
    }

    fn on_wake(&mut self, wake: Wake) -> Option<ChannelEvent> {
        match wake {
            Wake::Opened(Ok(link)) => {
                self.phase = Phase::Live(link);
                Some(ChannelEvent::Opened)
            }
            Wake::Opened(Err(e)) => {
                self.phase = Phase::Idle;
                if e.is_unauthorized() {
                    Some(ChannelEvent::AuthRejected { reason: e.message })
                } else {
                    Some(ChannelEvent::OpenFailed { reason: e.message })
                }
            }
            Wake::Signal(Some(signal)) => self.on_signal(signal),
            Wake::Signal(None) => {
                self.phase = Phase::Idle;
                Some(ChannelEvent::Closed {
                    reason: TRANSPORT_CLOSE_REASON.to_string(),
                })
            }
            Wake::Timer => {
                self.phase = Phase::Idle;
                Some(ChannelEvent::RetryTimer)
            }
            Wake::Refreshed(Ok(_)) => {
                self.phase = Phase::Idle;
                Some(ChannelEvent::AuthRefreshed)
            }
            Wake::Refreshed(Err(e)) => {
                self.phase = Phase::Idle;
                Some(ChannelEvent::AuthRefreshFailed { reason: e.message })
            }
        }
    }

    fn on_signal(&mut self, signal: ChannelSignal) -> Option<ChannelEvent> {
        match signal {
            ChannelSignal::Event { name, payload } => {
                metrics::counter!("channel_events_total", "event" => name.clone()).increment(1);
                if !self.registry.dispatch(&name, &payload) {
                    debug!(event = %name, "no handler for event");
                }
                None
            }
            ChannelSignal::AuthSucceeded => Some(ChannelEvent::AuthAccepted),
            ChannelSignal::AuthFailed { reason } => Some(ChannelEvent::AuthRejected { reason }),
            ChannelSignal::Closed { reason } => Some(ChannelEvent::Closed { reason }),
            ChannelSignal::Error { message } => Some(ChannelEvent::TransportError { message }),
        }
    }

    fn on_credential(&mut self, current: Option<Credential>) -> Option<ChannelEvent> {
        let Some(credential) = current else {
            self.last_token = None;
            return Some(ChannelEvent::CredentialCleared);
        };
        let token = credential
            .has_access_token()
            .then(|| credential.access_token.clone());
        if token == self.last_token {
            return None;
        }
        self.last_token = token;
        Some(ChannelEvent::TokenRotated)
    }

    /// Run an event and every follow-up it produces through the machine,
    /// then publish the resulting state.
    async fn process(&mut self, event: ChannelEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let (state, action) = handle_event(self.state.clone(), event, &self.config.backoff);
            self.state = state;
            next = self.execute(action).await;
        }
        self.publish_state();
    }

    async fn execute(&mut self, action: ChannelAction) -> Option<ChannelEvent> {
        match action {
            ChannelAction::Open => {
                self.close_link().await;
                // The handshake already carries this token
                self.last_token = match self.handshake_override.take() {
                    Some(token) => Some(token),
                    None => self.store.access_token(),
                };
                let token = self.last_token.clone();
                let transport = self.transport.clone();
                let timeout = self.config.handshake_timeout;
                info!(transport = %transport.id(), state = ?self.state, "opening channel");
                self.phase = Phase::Opening(Box::pin(async move {
                    match tokio::time::timeout(timeout, transport.open(Handshake::new(token))).await {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::timeout(timeout)),
                    }
                }));
                None
            }
            ChannelAction::Activate => {
                let Phase::Live(link) = &mut self.phase else {
                    return None;
                };
                for event in self.registry.events() {
                    if let Err(e) = link.sink.send(OutboundFrame::Subscribe { event }).await {
                        warn!(error = %e, "re-arming subscriptions failed");
                        return Some(ChannelEvent::TransportError { message: e.message });
                    }
                }
                info!(
                    transport = %self.transport.id(),
                    subscriptions = self.registry.len(),
                    "channel connected"
                );
                self.notify(ChannelNotice::Connected);
                None
            }
            ChannelAction::ScheduleReconnect {
                attempt,
                delay,
                reason,
            } => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "channel lost, reconnect scheduled"
                );
                self.phase = Phase::Backoff(Box::pin(tokio::time::sleep(delay)));
                self.notify(ChannelNotice::ReconnectScheduled { attempt, delay });
                None
            }
            ChannelAction::GiveUp { reason } => {
                error!(
                    attempts = self.config.backoff.max_attempts,
                    reason = %reason,
                    "channel reconnect attempts exhausted"
                );
                self.phase = Phase::Idle;
                self.notify(ChannelNotice::ReconnectFailed);
                None
            }
            ChannelAction::Release { notice } => {
                self.close_link().await;
                self.phase = Phase::Idle;
                info!(notice = ?notice, "channel released");
                self.notify(notice);
                None
            }
            ChannelAction::RefreshCredential { reason } => {
                self.close_link().await;
                info!(reason = %reason, "channel credential rejected, refreshing");
                let refresher = self.refresher.clone();
                self.phase = Phase::Refreshing(Box::pin(async move {
                    refresher.refresh_credential().await
                }));
                None
            }
            ChannelAction::Reauthenticate => {
                let Some(token) = self.store.access_token() else {
                    return None;
                };
                debug!("re-authenticating live channel");
                self.send_live(OutboundFrame::Authenticate { token }).await
            }
            ChannelAction::Notify(notice) => {
                self.notify(notice);
                None
            }
            ChannelAction::None => None,
        }
    }

    /// Gracefully close the live link, if there is one.
    async fn close_link(&mut self) {
        if let Phase::Live(mut link) = std::mem::replace(&mut self.phase, Phase::Idle) {
            link.sink.close().await;
        }
    }

    fn notify(&self, notice: ChannelNotice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }

    fn publish_state(&self) {
        let public = self.state.public();
        metrics::gauge!("channel_connected").set(if public == ConnectionState::Connected {
            1.0
        } else {
            0.0
        });
        self.state_tx.send_if_modified(|current| {
            if *current == public {
                return false;
            }
            debug!(from = current.label(), to = public.label(), "channel state changed");
            *current = public;
            true
        });
    }
}
