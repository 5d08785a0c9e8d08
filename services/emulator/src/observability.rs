//! Logging and metrics for the emulator service.
//!
//! Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`) and a
//! Prometheus recorder, and serves `/metrics`, `/live` and `/ready` over HTTP.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// The recorder is process-global; repeated service starts share one handle.
static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = parking_lot::const_mutex(None);

/// Install the tracing subscriber and the Prometheus recorder.
///
/// Safe to call more than once; later calls reuse the first recorder.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    let mut installed = METRICS_HANDLE.lock();
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    *installed = Some(handle.clone());
    Ok(handle)
}

pub fn router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

/// Serve metrics and health endpoints on an already bound listener.
pub async fn serve_metrics(handle: PrometheusHandle, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router(handle).into_make_service()).await
}

pub async fn bind_metrics(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener {addr}"))
}
