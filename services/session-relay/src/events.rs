//! Server-Sent Events fan-out of realtime domain events
//!
//! The relay subscribes the configured event names on the channel once at
//! startup; each handler publishes into an `EventHub` broadcast. Every
//! `GET /events` client gets its own receiver, so a slow browser tab lags
//! (and skips) without holding up the channel or other tabs.

use std::convert::Infallible;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures_util::Stream;
use realtime_channel::ReconnectingChannel;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const HUB_CAPACITY: usize = 256;

/// A domain event as received on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedEvent {
    pub name: String,
    pub payload: Value,
}

/// Broadcast point between channel handlers and SSE clients.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<RelayedEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Publish to every connected client. Returns the number of receivers.
    pub fn publish(&self, name: &str, payload: &Value) -> usize {
        self.tx
            .send(RelayedEvent {
                name: name.to_string(),
                payload: payload.clone(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayedEvent> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a channel handler for each event name that feeds this hub.
    pub async fn attach(&self, channel: &ReconnectingChannel, events: &[String]) {
        for event in events {
            let hub = self.clone();
            let name = event.clone();
            channel
                .subscribe(event, move |payload: &Value| {
                    let clients = hub.publish(&name, payload);
                    debug!(event = %name, clients, "relayed channel event");
                })
                .await;
        }
        info!(count = events.len(), "channel events attached to SSE hub");
    }
}

/// Build the `/events` router.
pub fn router(hub: EventHub) -> Router {
    Router::new()
        .route("/events", get(stream_events))
        .with_state(hub)
}

/// Turn a hub receiver into SSE frames. Lagged receivers skip ahead; the
/// stream ends when the hub is dropped.
fn event_stream(
    rx: broadcast::Receiver<RelayedEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let frame = Event::default()
                        .event(event.name)
                        .data(event.payload.to_string());
                    return Some((Ok(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// GET /events
async fn stream_events(
    State(hub): State<EventHub>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(clients = hub.client_count() + 1, "SSE client connected");
    Sse::new(event_stream(hub.subscribe())).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use realtime_channel::{ChannelConfig, ConnectionState, MockChannelTransport};
    use request_pipeline::RequestPipeline;
    use serde_json::json;
    use session_auth::{Credential, TokenStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use transport::MockHttpTransport;

    /// Read SSE text from a streaming body until `needle` shows up.
    async fn read_until(body: Body, needle: &str) -> String {
        let mut stream = body.into_data_stream();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if text.contains(needle) {
                break;
            }
        }
        text
    }

    #[tokio::test]
    async fn publish_without_clients_is_dropped() {
        let hub = EventHub::new();
        assert_eq!(hub.publish("contest:updated", &json!({})), 0);
    }

    #[tokio::test]
    async fn stream_yields_published_events_in_order() {
        let hub = EventHub::new();
        let mut stream = Box::pin(event_stream(hub.subscribe()));
        hub.publish("contest:updated", &json!({"id": 1}));
        hub.publish("vote:cast", &json!({"id": 2}));

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        drop(hub);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_client_skips_ahead() {
        let hub = EventHub::new();
        let mut stream = Box::pin(event_stream(hub.subscribe()));
        for n in 0..(HUB_CAPACITY + 10) {
            hub.publish("tick", &json!(n));
        }
        // Oldest events were overwritten; the stream resumes instead of ending
        assert!(stream.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn channel_events_reach_sse_clients() {
        let store = Arc::new(TokenStore::with_credential(Credential::new("at_1", "rt_1", None)));
        let pipeline = RequestPipeline::new(
            Arc::new(MockHttpTransport::canned(Duration::ZERO)),
            store.clone(),
            Default::default(),
        );
        let mock = MockChannelTransport::default();
        let channel = ReconnectingChannel::new(
            Arc::new(mock.clone()),
            store,
            Arc::new(pipeline),
            ChannelConfig::default(),
        );
        let hub = EventHub::new();
        hub.attach(&channel, &["contest:updated".to_string()]).await;
        channel.connect(None).await;
        channel
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let response = router(hub.clone())
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(hub.client_count(), 1);

        assert!(mock.deliver("contest:updated", json!({"id": 42})));
        let text = read_until(response.into_body(), "42").await;
        assert!(text.contains("event: contest:updated"), "got: {text}");
        assert!(text.contains(r#"data: {"id":42}"#), "got: {text}");
    }
}
