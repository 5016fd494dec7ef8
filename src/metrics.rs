//! Prometheus metrics for MoorStore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines metric name constants.  Counters are emitted at the call
//! sites in the cache, QoS, and engine modules; an embedding process
//! scrapes them through [`render_metrics`].

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Metadata cache hits (counter). Labels: table.
pub const META_CACHE_HITS_TOTAL: &str = "moorstore_meta_cache_hits_total";

/// Metadata cache misses (counter). Labels: table.
pub const META_CACHE_MISSES_TOTAL: &str = "moorstore_meta_cache_misses_total";

/// Requests denied by QoS limits (counter). Labels: direction.
pub const QOS_DENIED_TOTAL: &str = "moorstore_qos_denied_total";

/// QoS snapshot refresh failures (counter).
pub const QOS_REFRESH_FAILURES_TOTAL: &str = "moorstore_qos_refresh_failures_total";

/// Seconds spent waiting for bandwidth tokens (histogram).
pub const QOS_THROTTLE_WAIT_SECONDS: &str = "moorstore_qos_throttle_wait_seconds";

/// Garbage-collection entries enqueued (counter).
pub const GC_ENQUEUED_TOTAL: &str = "moorstore_gc_enqueued_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(META_CACHE_HITS_TOTAL, "Metadata cache hits");
    describe_counter!(META_CACHE_MISSES_TOTAL, "Metadata cache misses");
    describe_counter!(QOS_DENIED_TOTAL, "Requests denied by QoS limits");
    describe_counter!(QOS_REFRESH_FAILURES_TOTAL, "QoS snapshot refresh failures");
    describe_histogram!(
        QOS_THROTTLE_WAIT_SECONDS,
        "Seconds spent waiting for bandwidth tokens"
    );
    describe_counter!(GC_ENQUEUED_TOTAL, "Garbage-collection entries enqueued");
}

/// Render the current metrics in Prometheus exposition format, if the
/// recorder has been installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init_metrics() as *const PrometheusHandle;
        let second = init_metrics() as *const PrometheusHandle;
        assert_eq!(first, second);
        describe_metrics();
    }

    #[test]
    fn test_render_includes_recorded_counter() {
        init_metrics();
        describe_metrics();
        metrics::counter!(GC_ENQUEUED_TOTAL).increment(1);
        let rendered = render_metrics().expect("recorder installed");
        assert!(rendered.contains("moorstore_gc_enqueued_total"));
    }
}
