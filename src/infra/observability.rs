//! Tracing and Prometheus metrics setup.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Prometheus handle for on-demand scrape output (e.g. GET /metrics).
pub type PrometheusHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Install the global metrics recorder and return a handle for rendering.
///
/// Uses `PrometheusBuilder` without an HTTP listener; the application
/// exposes metrics via GET /metrics using `handle.render()`.
///
/// # Errors
/// Returns an error if a recorder is already installed or building fails.
pub fn init_metrics() -> Result<Arc<PrometheusHandle>, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("items_created_total", "Items persisted");
    metrics::describe_counter!(
        "items_unannounced_total",
        "Items persisted without an acknowledged creation event"
    );
    metrics::describe_counter!(
        "announcements_retried_total",
        "Re-announcement attempts by result"
    );
    metrics::describe_counter!(
        "announcement_ledger_errors_total",
        "Unannounced items that could not be recorded for retry"
    );
    metrics::describe_counter!("item_images_linked_total", "Images linked to items");
    metrics::describe_counter!("item_images_rejected_total", "Uploads rejected before storage");

    Ok(Arc::new(handle))
}
