//! Prometheus metrics exposition
//!
//! Relay-level series (the pipeline and channel crates record their own):
//!
//! - `relay_requests_total` (counter): labels `status`, `method`
//! - `relay_request_duration_seconds` (histogram): label `status`
//! - `relay_upstream_errors_total` (counter): label `error_type`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "relay_request_duration_seconds";

/// 5ms to 60s, covering the configurable request timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// Request duration renders as a histogram (`_bucket` lines) rather than the
/// exporter's default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed relayed request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a classified upstream failure.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// In-process counters reported by `/health`.
#[derive(Clone)]
pub struct RelayStats {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being relayed, reported when the drain times out
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a request and hold it in flight until the guard drops.
    pub fn begin(&self) -> InFlight {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight gauge on drop, including on cancellation.
pub struct InFlight {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Recorder/handle pair that does not touch the global recorder.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_upstream_error("timeout");
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(502, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("relay_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("status=\"502\""));
        assert!(output.contains("method=\"POST\""));
        assert!(
            output.contains("relay_request_duration_seconds_bucket"),
            "duration must render as a histogram"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn upstream_errors_are_labelled_by_type() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("network");

        let output = handle.render();
        assert!(output.contains("relay_upstream_errors_total"));
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"network\""));
    }

    #[test]
    fn in_flight_guard_tracks_requests() {
        let stats = RelayStats::new();
        let first = stats.begin();
        let second = stats.begin();
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 0);
        assert_eq!(stats.requests_total.load(Ordering::Relaxed), 2);
    }
}
