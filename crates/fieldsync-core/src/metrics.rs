//! Prometheus metrics helpers for fieldsync.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fieldsync_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9464, handle).await.unwrap();
//!
//!     metrics::counter!("reconcile_duplicates_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`reconcile_`, `historical_`, `live_`, `store_`)
//! - Suffix: `_total` for counters
//! - Labels: only `phase` (`backfill` / `live`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds before returning so a port conflict surfaces to the caller; serving
/// happens on a background task.
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
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics fieldsync records.
fn register_common_metrics() {
    // =========================================================================
    // Reconciliation
    // =========================================================================

    describe_counter!(
        "reconcile_records_admitted_total",
        "Records admitted to the store (label: phase)"
    );
    describe_counter!(
        "reconcile_duplicates_total",
        "Candidates rejected because their natural key was already stored (label: phase)"
    );
    describe_counter!(
        "reconcile_unkeyed_total",
        "Records admitted without a receipt timestamp (label: phase)"
    );
    describe_counter!(
        "reconcile_parse_errors_total",
        "Malformed lines or messages dropped (label: phase)"
    );

    // =========================================================================
    // Sources
    // =========================================================================

    describe_counter!(
        "historical_fetch_failures_total",
        "Historical queries that failed at the transport level"
    );
    describe_counter!(
        "live_subscription_errors_total",
        "Live subscriptions that ended with an error"
    );
    describe_gauge!(
        "ingest_running",
        "Whether the live phase is currently running (1=yes, 0=no)"
    );

    // =========================================================================
    // Record store
    // =========================================================================

    describe_counter!("store_persist_total", "Successful store rewrites");
    describe_counter!("store_persist_failures_total", "Failed store rewrites");
    describe_gauge!("store_records", "Records currently held by the store");
}

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

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
        increment("test_counter", 5);
        set_gauge("test_gauge", 0.0);
        set_gauge("test_gauge", 42.5);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
