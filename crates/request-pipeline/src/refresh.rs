//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the session credential before it
//! expires, so most requests never pay refresh latency. The task goes through
//! the pipeline's single-flight path, so a request-time refresh already in
//! flight is joined rather than duplicated.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pipeline::RequestPipeline;

/// Spawn a background task that proactively refreshes an expiring credential.
///
/// Runs every `interval` and refreshes when the stored credential expires
/// within `threshold`. A failed refresh is handled by the pipeline (store
/// cleared, `Expired` emitted); the task keeps ticking and simply finds
/// nothing to refresh until the next login.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    pipeline: RequestPipeline,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the credential was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pipeline, threshold).await;
        }
    })
}

/// Run one refresh cycle.
async fn refresh_cycle(pipeline: &RequestPipeline, threshold: Duration) {
    let Some(credential) = pipeline.store().get() else {
        debug!("no credential stored, skipping proactive refresh");
        return;
    };
    if !credential.has_refresh_token() || !credential.expires_within(threshold) {
        return;
    }

    debug!(
        expires_at = ?credential.expires_at,
        "credential expiring within threshold, refreshing"
    );
    match pipeline.refresh().await {
        Ok(refreshed) => {
            info!(expires_at = ?refreshed.expires_at, "background token refresh succeeded");
        }
        Err(e) => {
            warn!(error = %e, "background token refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use reqwest::Method;
    use session_auth::{Credential, REFRESH_PATH, TokenStore, now_millis};
    use transport::{HttpResponse, MockHttpTransport};

    use crate::PipelineConfig;

    fn pipeline_with(transport: Arc<MockHttpTransport>, credential: Credential) -> RequestPipeline {
        RequestPipeline::new(
            transport,
            Arc::new(TokenStore::with_credential(credential)),
            PipelineConfig::default(),
        )
    }

    fn refresh_route(transport: &MockHttpTransport) {
        transport.route(Method::POST, REFRESH_PATH, |_| {
            Ok(HttpResponse::json(
                200,
                &serde_json::json!({"access_token": "at_new", "refresh_token": "rt_new", "expires_in": 3600}),
            ))
        });
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let transport = Arc::new(MockHttpTransport::new(Duration::ZERO));
        refresh_route(&transport);
        // Token expires far in the future, no refresh attempted
        let pipeline = pipeline_with(
            transport.clone(),
            Credential::new("at_a", "rt_a", Some(4_102_444_800_000)),
        );

        refresh_cycle(&pipeline, Duration::from_secs(900)).await;

        assert_eq!(transport.call_count(REFRESH_PATH), 0);
        assert_eq!(pipeline.store().access_token().unwrap().as_str(), "at_a");
    }

    #[tokio::test]
    async fn refresh_cycle_refreshes_expiring_token() {
        let transport = Arc::new(MockHttpTransport::new(Duration::ZERO));
        refresh_route(&transport);
        let pipeline = pipeline_with(
            transport.clone(),
            Credential::new("at_a", "rt_a", Some(now_millis() + 1000)),
        );

        refresh_cycle(&pipeline, Duration::from_secs(900)).await;

        assert_eq!(transport.call_count(REFRESH_PATH), 1);
        assert_eq!(pipeline.store().access_token().unwrap().as_str(), "at_new");
    }

    #[tokio::test]
    async fn refresh_cycle_rejected_token_clears_session() {
        let transport = Arc::new(MockHttpTransport::new(Duration::ZERO));
        transport.route(Method::POST, REFRESH_PATH, |_| Ok(HttpResponse::new(403, "")));
        let pipeline = pipeline_with(
            transport.clone(),
            Credential::new("at_a", "rt_a", Some(now_millis())),
        );

        refresh_cycle(&pipeline, Duration::from_secs(900)).await;

        assert!(pipeline.store().get().is_none());
        refresh_cycle(&pipeline, Duration::from_secs(900)).await;
        assert_eq!(transport.call_count(REFRESH_PATH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_refreshes_on_interval() {
        let transport = Arc::new(MockHttpTransport::new(Duration::ZERO));
        refresh_route(&transport);
        let pipeline = pipeline_with(
            transport.clone(),
            Credential::new("at_a", "rt_a", Some(now_millis() + 1000)),
        );

        let handle = spawn_refresh_task(
            pipeline.clone(),
            Duration::from_secs(300),
            Duration::from_secs(900),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.call_count(REFRESH_PATH), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.call_count(REFRESH_PATH), 1);
        handle.abort();
    }
}
