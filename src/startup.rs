//! Ordering of service startup

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::TelemetryError;
use crate::listener::Listener;
use crate::liveness::LivenessDetector;

/// Clear connection status left by a previous run, then start the listeners
///
/// No listener is started when the status reset fails.
pub async fn open_listeners(
    liveness: &LivenessDetector,
    listeners: Vec<Listener>,
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>, TelemetryError> {
    let marked = liveness.mark_all_disconnected().await?;
    info!(marked, listeners = listeners.len(), "Starting listeners");

    Ok(listeners
        .into_iter()
        .map(|listener| tokio::spawn(listener.run(cancel.clone())))
        .collect())
}
