//! Persistent realtime channel for the dashboard
//!
//! `ReconnectingChannel` keeps one authenticated connection open through a
//! `ChannelTransport`, reconnects under exponential backoff, replays every
//! subscription onto each new connection before reporting `Connected`, and
//! follows the shared `TokenStore`: a rotated token re-authenticates the
//! live connection, a cleared one closes it.
//!
//! Transitions live in `machine::handle_event`, a pure function; the actor in
//! `channel` executes the actions it returns.

pub mod channel;
pub mod link;
pub mod machine;
pub mod mock;
pub mod registry;
pub mod ws;

pub use channel::{ChannelConfig, ReconnectingChannel};
pub use link::{
    ChannelLink, ChannelSignal, ChannelSink, ChannelTransport, Handshake, OutboundFrame,
};
pub use machine::{BackoffPolicy, ChannelNotice, ConnectionState};
pub use mock::{MockChannelTransport, OpenOutcome};
pub use registry::EventHandler;
pub use ws::WsChannelTransport;
