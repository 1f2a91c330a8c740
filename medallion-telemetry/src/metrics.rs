use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

/// Port on which [`init_metrics`] exposes the Prometheus endpoint.
pub const METRICS_PORT: u16 = 9000;

// Cached handle for [`init_metrics_handle`]. A [`Mutex`] is used because the
// initialization is fallible and the global recorder can only be installed once,
// while tests call this function many times.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs the global recorder without an HTTP listener and returns a handle for rendering.
///
/// Subsequent calls return the cached handle. Must be called inside a tokio runtime
/// because it spawns the periodic upkeep task.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut prometheus_handle = PROMETHEUS_HANDLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = &*prometheus_handle {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *prometheus_handle = Some(handle.clone());

    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trace!("running metrics upkeep");
            upkeep_handle.run_upkeep();
        }
    });

    Ok(handle)
}

/// Installs the global recorder and serves `/metrics` on `[::]:9000`.
///
/// Every series carries a `pipeline_id` label.
pub fn init_metrics(pipeline_id: u64) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            METRICS_PORT,
        ))
        .add_global_label("pipeline_id", pipeline_id.to_string())
        .install()
}
