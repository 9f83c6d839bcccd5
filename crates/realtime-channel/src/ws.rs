//! WebSocket channel transport (tokio-tungstenite)
//!
//! One TCP connection per link. The handshake frame goes out first and the
//! open resolves on the server's `connect` (or fails on `connect_error`). A
//! pump task then decodes inbound text frames into signals until the
//! connection ends; dropping the sink aborts it.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use transport::{ApiError, BoxFuture};

use crate::link::{
    ChannelLink, ChannelSignal, ChannelSink, ChannelTransport, Handshake, OutboundFrame,
    TRANSPORT_CLOSE_REASON, handshake_error, reason_text,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct WsChannelTransport {
    url: String,
}

impl WsChannelTransport {
    /// `url` is a `ws://` or `wss://` endpoint (rustls, webpki roots).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ChannelTransport for WsChannelTransport {
    fn id(&self) -> &str {
        "websocket"
    }

    fn open(&self, handshake: Handshake) -> BoxFuture<'_, Result<ChannelLink, ApiError>> {
        Box::pin(open_link(&self.url, handshake))
    }
}

async fn open_link(url: &str, handshake: Handshake) -> Result<ChannelLink, ApiError> {
    let (stream, _) = connect_async(url).await.map_err(upgrade_error)?;
    let (mut write, mut read) = stream.split();

    write
        .send(Message::Text(handshake.to_frame().to_string()))
        .await
        .map_err(|e| ApiError::socket(format!("handshake send failed: {e}")))?;

    await_connect(&mut read).await?;
    debug!(url = %url, "channel handshake accepted");

    let (tx, rx) = mpsc::unbounded_channel();
    let pump = tokio::spawn(pump(read, tx));
    Ok(ChannelLink {
        sink: Box::new(WsSink { write, pump }),
        signals: rx,
    })
}

/// Wait for the server's verdict on the handshake. Frames before it are
/// ignored.
async fn await_connect(read: &mut SplitStream<WsStream>) -> Result<(), ApiError> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    debug!("ignoring non-JSON frame before connect");
                    continue;
                };
                let data = frame.get("data").unwrap_or(&Value::Null);
                match frame.get("event").and_then(Value::as_str) {
                    Some("connect") => return Ok(()),
                    Some("connect_error") => return Err(handshake_error(data)),
                    Some("disconnect") => {
                        return Err(ApiError::socket(
                            reason_text(data).unwrap_or_else(|| TRANSPORT_CLOSE_REASON.to_string()),
                        ));
                    }
                    _ => continue,
                }
            }
            Ok(Message::Close(frame)) => return Err(ApiError::socket(close_reason(frame))),
            Ok(_) => continue,
            Err(e) => return Err(ApiError::socket(e.to_string())),
        }
    }
    Err(ApiError::socket(TRANSPORT_CLOSE_REASON))
}

/// Forward inbound frames as signals until the connection ends or the
/// receiver goes away.
async fn pump(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<ChannelSignal>) {
    while let Some(message) = read.next().await {
        let signal = match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(frame) => match ChannelSignal::from_frame(&frame) {
                    Some(signal) => signal,
                    None => continue,
                },
                Err(e) => {
                    warn!(error = %e, "dropping malformed channel frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => ChannelSignal::Closed {
                reason: close_reason(frame),
            },
            // Pings are answered by tungstenite; binary frames are unused
            Ok(_) => continue,
            Err(e) => ChannelSignal::Error {
                message: e.to_string(),
            },
        };
        let terminal = matches!(
            signal,
            ChannelSignal::Closed { .. } | ChannelSignal::Error { .. }
        );
        if tx.send(signal).is_err() || terminal {
            return;
        }
    }
    let _ = tx.send(ChannelSignal::Closed {
        reason: TRANSPORT_CLOSE_REASON.to_string(),
    });
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> String {
    frame
        .map(|f| f.reason.to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| TRANSPORT_CLOSE_REASON.to_string())
}

/// A refused upgrade with 401/403 is a credential rejection; everything
/// else is a retryable socket failure.
fn upgrade_error(error: WsError) -> ApiError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let message = format!("upgrade refused with status {status}");
            if status == 401 || status == 403 {
                ApiError::unauthorized(message).with_status(status)
            } else {
                ApiError::socket(message).with_status(status)
            }
        }
        other => ApiError::socket(other.to_string()),
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
    pump: JoinHandle<()>,
}

impl ChannelSink for WsSink {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move {
            self.write
                .send(Message::Text(frame.to_frame().to_string()))
                .await
                .map_err(|e| ApiError::socket(format!("send failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if tokio::time::timeout(CLOSE_TIMEOUT, self.write.close())
                .await
                .is_err()
            {
                debug!("close handshake timed out");
            }
            self.pump.abort();
        })
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
