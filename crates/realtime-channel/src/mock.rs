//! Scripted in-memory channel transport
//!
//! Opens succeed or fail according to a script (falling back to a default
//! outcome), and the live connection records which events are armed and
//! which frames were sent. Server pushes are simulated with `deliver`,
//! `signal` and `drop_connection`. Used by the channel tests and by the
//! relay's mock mode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use transport::{ApiError, BoxFuture};

use crate::link::{
    ChannelLink, ChannelSignal, ChannelSink, ChannelTransport, Handshake, OutboundFrame,
};

/// Result of one `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    /// Retryable open failure with this reason
    Fail(String),
    /// Handshake refused as unauthorized
    RejectAuth(String),
    /// Never completes; exercises the handshake timeout
    Hang,
}

struct Live {
    generation: u64,
    armed: Vec<String>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

struct State {
    script: VecDeque<OpenOutcome>,
    default: OpenOutcome,
    opens: usize,
    handshakes: Vec<Option<String>>,
    next_generation: u64,
    live: Option<Live>,
    sent: Vec<OutboundFrame>,
    ack_auth: bool,
}

impl State {
    /// Clear the live connection only if it is still the given one.
    fn release(&mut self, generation: u64) {
        if self.live.as_ref().is_some_and(|l| l.generation == generation) {
            self.live = None;
        }
    }
}

#[derive(Clone)]
pub struct MockChannelTransport {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl Default for MockChannelTransport {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl MockChannelTransport {
    /// Transport that accepts every open after `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                script: VecDeque::new(),
                default: OpenOutcome::Accept,
                opens: 0,
                handshakes: Vec::new(),
                next_generation: 0,
                live: None,
                sent: Vec::new(),
                ack_auth: true,
            })),
            latency,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue outcomes for the next opens, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) -> &Self {
        self.lock().script.extend(outcomes);
        self
    }

    /// Outcome used once the script is exhausted.
    pub fn set_default(&self, outcome: OpenOutcome) -> &Self {
        self.lock().default = outcome;
        self
    }

    /// Whether `auth` frames are answered with `auth:success` (default true).
    pub fn set_auth_ack(&self, ack: bool) -> &Self {
        self.lock().ack_auth = ack;
        self
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Token presented in each handshake, in order.
    pub fn handshake_tokens(&self) -> Vec<Option<String>> {
        self.lock().handshakes.clone()
    }

    pub fn is_live(&self) -> bool {
        self.lock().live.is_some()
    }

    /// Events armed on the live connection, in arming order.
    pub fn armed_events(&self) -> Vec<String> {
        self.lock()
            .live
            .as_ref()
            .map(|l| l.armed.clone())
            .unwrap_or_default()
    }

    /// Every frame sent over any connection.
    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.lock().sent.clone()
    }

    /// Push a domain event. Only armed events reach the client, as with a
    /// real server. Returns `false` when nothing was delivered.
    pub fn deliver(&self, event: &str, payload: serde_json::Value) -> bool {
        let state = self.lock();
        match &state.live {
            Some(live) if live.armed.iter().any(|e| e == event) => live
                .signals
                .send(ChannelSignal::Event {
                    name: event.to_string(),
                    payload,
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Push an arbitrary signal on the live connection.
    pub fn signal(&self, signal: ChannelSignal) -> bool {
        match &self.lock().live {
            Some(live) => live.signals.send(signal).is_ok(),
            None => false,
        }
    }

    /// Close the live connection from the server side with `reason`.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let Some(live) = self.lock().live.take() else {
            return false;
        };
        debug!(reason = %reason, "mock channel dropping connection");
        let _ = live.signals.send(ChannelSignal::Closed {
            reason: reason.to_string(),
        });
        true
    }
}

impl ChannelTransport for MockChannelTransport {
    fn id(&self) -> &str {
        "mock"
    }

    fn open(&self, handshake: Handshake) -> BoxFuture<'_, Result<ChannelLink, ApiError>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let outcome = {
                let mut state = self.lock();
                state.opens += 1;
                state
                    .handshakes
                    .push(handshake.token.as_ref().map(|t| t.as_str().to_string()));
                match state.script.pop_front() {
                    Some(outcome) => outcome,
                    None => state.default.clone(),
                }
            };

            match outcome {
                OpenOutcome::Accept => {}
                OpenOutcome::Fail(reason) => return Err(ApiError::socket(reason)),
                OpenOutcome::RejectAuth(reason) => return Err(ApiError::unauthorized(reason)),
                OpenOutcome::Hang => std::future::pending::<()>().await,
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let generation = {
                let mut state = self.lock();
                state.next_generation += 1;
                let generation = state.next_generation;
                state.live = Some(Live {
                    generation,
                    armed: Vec::new(),
                    signals: tx,
                });
                generation
            };

            Ok(ChannelLink {
                sink: Box::new(MockSink {
                    state: self.state.clone(),
                    generation,
                }),
                signals: rx,
            })
        })
    }
}

struct MockSink {
    state: Arc<Mutex<State>>,
    generation: u64,
}

impl MockSink {
    fn apply(&self, frame: OutboundFrame) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ack_auth = state.ack_auth;
        let live = match state.live.as_mut() {
            Some(live) if live.generation == self.generation => live,
            _ => return Err(ApiError::socket("connection closed")),
        };
        match &frame {
            OutboundFrame::Subscribe { event } => {
                if !live.armed.contains(event) {
                    live.armed.push(event.clone());
                }
            }
            OutboundFrame::Unsubscribe { event } => live.armed.retain(|e| e != event),
            OutboundFrame::Authenticate { .. } => {
                let signal = if ack_auth {
                    ChannelSignal::AuthSucceeded
                } else {
                    ChannelSignal::AuthFailed {
                        reason: "invalid token".to_string(),
                    }
                };
                let _ = live.signals.send(signal);
            }
            OutboundFrame::Emit { .. } => {}
        }
        state.sent.push(frame);
        Ok(())
    }
}

impl ChannelSink for MockSink {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<(), ApiError>> {
        let result = self.apply(frame);
        Box::pin(async move { result })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        let generation = self.generation;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(generation);
        Box::pin(async {})
    }
}

impl Drop for MockSink {
    fn drop(&mut self) {
        let generation = self.generation;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(generation);
    }
}
