//! Prometheus metrics helpers for WatchedSky.
//!
//! This module provides metrics initialization and the metric descriptions
//! shared by the poller, publisher and reconciler.
//!
//! # Usage
//!
//! ```rust,ignore
//! use watchedsky_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("poller_ticks_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`poller_`, `publisher_`, `reconciler_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only for small closed sets (e.g., error kind)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed, instead of panicking.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` and serves `/metrics` from a background task.
/// Bind failures are returned; serve failures are logged.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the pipeline's metrics.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    describe_gauge!("ingestion_running", "1 while the ingestion daemon is running");

    // =========================================================================
    // Alert Poller
    // =========================================================================

    describe_counter!("poller_ticks_total", "Poll ticks started");
    describe_counter!(
        "poller_tick_failures_total",
        "Poll ticks that failed (label: kind)"
    );
    describe_counter!(
        "poller_alerts_fetched_total",
        "Alerts returned by the upstream feed"
    );
    describe_counter!(
        "poller_alerts_inserted_total",
        "New alerts written to the document store"
    );
    describe_counter!(
        "poller_alerts_dropped_total",
        "Feed alerts dropped because they could not be decoded"
    );
    describe_gauge!(
        "poller_cursor_timestamp_seconds",
        "Sent time of the newest ingested alert (Unix seconds)"
    );
    describe_gauge!(
        "poller_pending_publications",
        "Stored alerts waiting to be retried on the ledger"
    );
    describe_histogram!("poller_tick_duration_seconds", "Wall time of a poll tick");

    // =========================================================================
    // Publisher
    // =========================================================================

    describe_counter!(
        "publisher_records_created_total",
        "Alert records created on the ledger"
    );
    describe_counter!(
        "publisher_blobs_uploaded_total",
        "Geometry blobs uploaded to the ledger"
    );
    describe_counter!("publisher_errors_total", "Failed publications");

    // =========================================================================
    // Firehose Reconciler
    // =========================================================================

    describe_counter!(
        "reconciler_commits_total",
        "Commits received from the firehose"
    );
    describe_counter!(
        "reconciler_alerts_persisted_total",
        "Verified alerts upserted into the document store"
    );
    describe_counter!(
        "reconciler_replays_skipped_total",
        "Already reconciled records seen again"
    );
    describe_counter!(
        "reconciler_integrity_failures_total",
        "Records whose block did not match the declared CID"
    );
    describe_counter!(
        "reconciler_notifications_total",
        "Notification posts created"
    );
    describe_counter!(
        "reconciler_errors_total",
        "Per-event reconciliation errors (label: kind)"
    );
    describe_gauge!(
        "reconciler_last_seq",
        "Sequence number of the last firehose commit seen"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter labelled with an error kind.
#[inline]
pub fn increment_kind(name: &'static str, kind: &'static str) {
    metrics::counter!(name, "kind" => kind).increment(1);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 3);
        increment_kind("test_kind_counter", "transport");
        set_gauge("test_gauge", 1_704_067_200.0);
        set_gauge("test_gauge", -1.0);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
