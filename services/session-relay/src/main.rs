//! Session Relay
//!
//! Single-binary service that hosts the dashboard transport core for a
//! local frontend:
//! 1. Restores (or bootstraps) the session credential
//! 2. Forwards `/api/*` through the authenticated request pipeline
//! 3. Keeps the realtime channel connected and fans its events out over SSE
//! 4. Exposes session control, health and Prometheus metrics

mod config;
mod error;
mod events;
mod metrics;
mod proxy;
mod session;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use realtime_channel::{
    ChannelNotice, ChannelTransport, ConnectionState, MockChannelTransport, ReconnectingChannel,
    WsChannelTransport,
};
use request_pipeline::{RequestPipeline, SessionEvent, spawn_refresh_task};
use session_auth::{Credential, TokenStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{ErrorKind, HttpTransport, MockHttpTransport, ReqwestTransport};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::{Config, Mode};
use crate::error::RelayError;
use crate::events::EventHub;
use crate::metrics::RelayStats;
use crate::session::SessionState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from the core handlers
#[derive(Clone)]
struct AppState {
    pipeline: RequestPipeline,
    channel: ReconnectingChannel,
    stats: RelayStats,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit covers every route; an SSE stream only holds a
/// permit until its response head is sent.
fn build_router(state: AppState, hub: EventHub, max_connections: usize) -> Router {
    let session_state = SessionState {
        pipeline: state.pipeline.clone(),
        channel: state.channel.clone(),
    };
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(session::router(session_state))
        .merge(events::router(hub))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// The two transports, chosen once from `relay.mode`.
fn build_transports(config: &Config) -> Result<(Arc<dyn HttpTransport>, Arc<dyn ChannelTransport>)> {
    match config.relay.mode {
        Mode::Live => {
            let client = reqwest::Client::builder()
                .build()
                .context("failed to build HTTP client")?;
            let http: Arc<dyn HttpTransport> =
                Arc::new(ReqwestTransport::new(client, config.api.base_url.clone()));
            let channel: Arc<dyn ChannelTransport> =
                Arc::new(WsChannelTransport::new(config.channel.url.clone()));
            Ok((http, channel))
        }
        Mode::Mock => {
            let latency = Duration::from_millis(config.mock.latency_ms);
            warn!(latency_ms = config.mock.latency_ms, "running against mock transports");
            let http: Arc<dyn HttpTransport> = Arc::new(MockHttpTransport::canned(latency));
            let channel: Arc<dyn ChannelTransport> = Arc::new(MockChannelTransport::new(latency));
            Ok((http, channel))
        }
    }
}

/// Seed a bootstrap refresh token unless a refreshable credential is
/// already persisted, then mint an access token if the stored one is
/// missing or expiring. Failure leaves the relay running logged out.
async fn prepare_session(config: &Config, pipeline: &RequestPipeline) {
    let store = pipeline.store();
    if let Some(token) = &config.session.refresh_token {
        if store.can_refresh() {
            info!("persisted credential found, ignoring bootstrap refresh token");
        } else if let Err(e) = store.set(Credential::from_refresh_token(token.clone())).await {
            warn!(error = %e, "failed to persist bootstrap credential");
        }
    }

    let stale = store.get().is_some_and(|c| {
        c.has_refresh_token()
            && (!c.has_access_token() || c.expires_within(config.pipeline_config().refresh_skew))
    });
    if stale {
        match pipeline.refresh().await {
            Ok(credential) => info!(expires_at = ?credential.expires_at, "session restored"),
            Err(e) => warn!(error = %e, "could not restore session, login required"),
        }
    }
}

/// Log channel notices and session signals until the senders go away.
fn spawn_lifecycle_logger(channel: &ReconnectingChannel, pipeline: &RequestPipeline) {
    let mut notices = channel.notices();
    let mut session = pipeline.subscribe_session();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = notices.recv() => match notice {
                    Ok(ChannelNotice::ReconnectFailed) => error!("channel gave up reconnecting"),
                    Ok(ChannelNotice::AuthFailed { reason }) => warn!(reason = %reason, "channel authentication failed"),
                    Ok(notice) => info!(?notice, "channel notice"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                event = session.recv() => match event {
                    Ok(SessionEvent::Expired) => warn!("session expired, login required"),
                    Ok(SessionEvent::Refreshed) => info!("session refreshed"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.relay.listen_addr,
        mode = ?config.relay.mode,
        api = %config.api.base_url,
        channel = %config.channel.url,
        events = config.channel.events.len(),
        "configuration loaded"
    );

    let store = TokenStore::load(&config.session.credential_file)
        .await
        .with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.session.credential_file.display()
            )
        })?;
    let store = Arc::new(store);

    let (http_transport, channel_transport) = build_transports(&config)?;
    let pipeline = RequestPipeline::new(http_transport, store.clone(), config.pipeline_config());
    prepare_session(&config, &pipeline).await;

    let refresh_task = spawn_refresh_task(
        pipeline.clone(),
        Duration::from_secs(config.session.refresh_interval_secs),
        Duration::from_secs(config.session.refresh_threshold_secs),
    );

    let channel = ReconnectingChannel::new(
        channel_transport,
        store,
        Arc::new(pipeline.clone()),
        config.channel_config(),
    );
    spawn_lifecycle_logger(&channel, &pipeline);

    let hub = EventHub::new();
    hub.attach(&channel, &config.channel.events).await;
    channel.connect(None).await;

    let stats = RelayStats::new();
    let in_flight = stats.in_flight.clone();
    let app_state = AppState {
        pipeline,
        channel: channel.clone(),
        stats,
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, hub, config.relay.max_connections);

    let listen_addr = config.relay.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the
    // timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    refresh_task.abort();
    channel.disconnect().await;

    info!("shutdown complete");
    Ok(())
}

/// Returns 200 when the channel is connected, 503 (degraded) otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let channel_state = state.channel.state();
    let logged_in = state.pipeline.store().get().is_some();
    let status_code = if channel_state == ConnectionState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if status_code == StatusCode::OK { "healthy" } else { "degraded" },
        "channel": channel_state.label(),
        "logged_in": logged_in,
        "refresh_in_progress": state.pipeline.refresh_in_progress(),
        "transport": state.pipeline.transport_id(),
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "errors_total": state.stats.errors_total.load(Ordering::Relaxed),
    });

    (status_code, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Catch-all: `/api/*` is relayed upstream, anything else is a 404 envelope.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let path = request.uri().path();
    if path != "/api" && !path.starts_with("/api/") {
        return RelayError::local(
            StatusCode::NOT_FOUND,
            ErrorKind::Unknown,
            format!("no route for {path}"),
            request_id,
        )
        .into_response();
    }
    proxy::proxy_request(&state.pipeline, &state.stats, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
