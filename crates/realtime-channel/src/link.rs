//! Channel link seam and wire frames
//!
//! A `ChannelTransport` opens one authenticated connection and hands back a
//! `ChannelLink`: a sink for outbound frames plus a stream of inbound
//! signals. The reconnecting channel owns at most one link at a time and
//! never reuses a link after it reports `Closed` or `Error`.
//!
//! Frames are JSON text objects `{"event": name, "data": payload}`. Lifecycle
//! names (`connect`, `disconnect`, `connect_error`, `auth:success`,
//! `auth:failed`) are decoded into signals; every other name is a domain
//! event delivered through the subscription registry.

use common::Secret;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use transport::{ApiError, BoxFuture, ErrorKind};

/// Reason reported when the inbound stream ends without a close frame.
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";

/// Credential presented in the first frame of a connection.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub token: Option<Secret<String>>,
}

impl Handshake {
    pub fn new(token: Option<Secret<String>>) -> Self {
        Self { token }
    }

    /// `{"event":"handshake","data":{"auth":{"token":...}}}`
    pub fn to_frame(&self) -> Value {
        let token = self.token.as_ref().map(|t| t.as_str());
        json!({ "event": "handshake", "data": { "auth": { "token": token } } })
    }
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Subscribe { event: String },
    Unsubscribe { event: String },
    Emit { event: String, payload: Value },
    /// Re-authenticate the live connection after a token rotation
    Authenticate { token: Secret<String> },
}

impl OutboundFrame {
    pub fn to_frame(&self) -> Value {
        match self {
            OutboundFrame::Subscribe { event } => {
                json!({ "event": "subscribe", "data": { "event": event } })
            }
            OutboundFrame::Unsubscribe { event } => {
                json!({ "event": "unsubscribe", "data": { "event": event } })
            }
            OutboundFrame::Emit { event, payload } => json!({ "event": event, "data": payload }),
            OutboundFrame::Authenticate { token } => {
                json!({ "event": "auth", "data": { "token": token.as_str() } })
            }
        }
    }
}

/// Server → client signal on a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Domain event for the registry
    Event { name: String, payload: Value },
    /// The server accepted a re-authentication
    AuthSucceeded,
    /// The server rejected the connection's credential
    AuthFailed { reason: String },
    /// The connection closed; the reason decides whether to reconnect
    Closed { reason: String },
    /// Transport-level failure
    Error { message: String },
}

impl ChannelSignal {
    /// Decode a `{"event","data"}` frame received after the handshake.
    /// Returns `None` for frames that carry no signal (a late `connect`,
    /// malformed objects).
    pub fn from_frame(frame: &Value) -> Option<Self> {
        let name = frame.get("event")?.as_str()?;
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        let signal = match name {
            "connect" => return None,
            "disconnect" => ChannelSignal::Closed {
                reason: reason_text(&data).unwrap_or_else(|| TRANSPORT_CLOSE_REASON.to_string()),
            },
            "connect_error" => ChannelSignal::Error {
                message: reason_text(&data).unwrap_or_else(|| "connect error".to_string()),
            },
            "auth:success" => ChannelSignal::AuthSucceeded,
            "auth:failed" => ChannelSignal::AuthFailed {
                reason: reason_text(&data).unwrap_or_else(|| "authentication failed".to_string()),
            },
            _ => ChannelSignal::Event {
                name: name.to_string(),
                payload: data,
            },
        };
        Some(signal)
    }
}

/// Reason string from a lifecycle payload: a bare string, or an object with
/// `message` / `reason`.
pub(crate) fn reason_text(data: &Value) -> Option<String> {
    if let Some(s) = data.as_str() {
        return Some(s.to_string());
    }
    ["message", "reason"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Classify a `connect_error` payload received during the handshake.
///
/// A code that maps to `Unauthorized` or a message mentioning it means the
/// credential was refused; anything else is an ordinary open failure.
pub(crate) fn handshake_error(data: &Value) -> ApiError {
    let message = reason_text(data).unwrap_or_else(|| "connect error".to_string());
    let code_unauthorized = data
        .get("code")
        .and_then(Value::as_str)
        .is_some_and(|code| ErrorKind::from_code(code) == ErrorKind::Unauthorized);
    let lowered = message.to_ascii_lowercase();
    if code_unauthorized || lowered.contains("unauthorized") || lowered.contains("jwt expired") {
        ApiError::unauthorized(message)
    } else {
        ApiError::socket(message)
    }
}

/// Outbound half of a live link.
pub trait ChannelSink: Send {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<(), ApiError>>;

    /// Close the connection. Dropping the sink closes it too, without the
    /// close handshake.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// One opened connection.
pub struct ChannelLink {
    pub sink: Box<dyn ChannelSink>,
    pub signals: mpsc::UnboundedReceiver<ChannelSignal>,
}

/// Capability set of a realtime transport.
///
/// `open` resolves once the server has accepted the handshake. A credential
/// rejection must surface as an `Unauthorized` error so the channel can drive
/// a refresh; every other failure is retried under backoff.
pub trait ChannelTransport: Send + Sync {
    /// Identifier for logging (e.g. "websocket", "mock")
    fn id(&self) -> &str;

    fn open(&self, handshake: Handshake) -> BoxFuture<'_, Result<ChannelLink, ApiError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_frame_carries_token() {
        let frame = Handshake::new(Some(Secret::from("at_1"))).to_frame();
        assert_eq!(frame["event"], "handshake");
        assert_eq!(frame["data"]["auth"]["token"], "at_1");

        let anonymous = Handshake::default().to_frame();
        assert!(anonymous["data"]["auth"]["token"].is_null());
    }

    #[test]
    fn outbound_frames_encode() {
        let frame = OutboundFrame::Subscribe {
            event: "contest:updated".into(),
        }
        .to_frame();
        assert_eq!(frame, json!({"event": "subscribe", "data": {"event": "contest:updated"}}));

        let frame = OutboundFrame::Emit {
            event: "vote:cast".into(),
            payload: json!({"contest_id": 3}),
        }
        .to_frame();
        assert_eq!(frame, json!({"event": "vote:cast", "data": {"contest_id": 3}}));

        let frame = OutboundFrame::Authenticate {
            token: Secret::from("at_2"),
        }
        .to_frame();
        assert_eq!(frame, json!({"event": "auth", "data": {"token": "at_2"}}));
    }

    #[test]
    fn lifecycle_frames_decode_to_signals() {
        assert_eq!(
            ChannelSignal::from_frame(&json!({"event": "disconnect", "data": "io server disconnect"})),
            Some(ChannelSignal::Closed {
                reason: "io server disconnect".into()
            })
        );
        assert_eq!(
            ChannelSignal::from_frame(&json!({"event": "auth:success"})),
            Some(ChannelSignal::AuthSucceeded)
        );
        assert_eq!(
            ChannelSignal::from_frame(&json!({"event": "auth:failed", "data": {"message": "jwt expired"}})),
            Some(ChannelSignal::AuthFailed {
                reason: "jwt expired".into()
            })
        );
        assert_eq!(ChannelSignal::from_frame(&json!({"event": "connect"})), None);
        assert_eq!(ChannelSignal::from_frame(&json!({"data": 1})), None);
    }

    #[test]
    fn domain_frames_decode_to_events() {
        let signal =
            ChannelSignal::from_frame(&json!({"event": "contest:updated", "data": {"id": 9}}))
                .unwrap();
        assert_eq!(
            signal,
            ChannelSignal::Event {
                name: "contest:updated".into(),
                payload: json!({"id": 9})
            }
        );
    }

    #[test]
    fn handshake_error_detects_auth_rejection() {
        assert!(handshake_error(&json!("Unauthorized")).is_unauthorized());
        assert!(handshake_error(&json!({"code": "TOKEN_EXPIRED", "message": "expired"})).is_unauthorized());
        let other = handshake_error(&json!({"message": "server full"}));
        assert_eq!(other.kind, ErrorKind::Socket);
        assert!(other.retryable);
    }
}
