// Reconnect sweeper.
//
// Sessions survive deploys: on startup, every device with a persisted auth
// row gets reconnected, staggered so a large fleet does not stampede the
// transport or the database. Per-device failures are logged and do not
// abort the sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use gateway_shared::GatewayResult;

use crate::session::SessionManager;
use crate::store::StateStore;

/// Connect each device in order, waiting `stagger` between calls. Returns
/// how many connects succeeded.
pub async fn run_sweep<F, Fut>(device_ids: Vec<Uuid>, stagger: Duration, connect: F) -> usize
where
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let total = device_ids.len();
    let mut connected = 0;

    for (index, device_id) in device_ids.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(stagger).await;
        }
        match connect(device_id).await {
            Ok(()) => {
                connected += 1;
                tracing::info!(device_id = %device_id, index = index + 1, total, "sweep reconnected device");
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "sweep reconnect failed");
            }
        }
    }

    connected
}

/// Startup entry point: wait out the configured delay, then sweep every
/// device that has a persisted session.
pub async fn run(
    manager: SessionManager,
    store: Arc<dyn StateStore>,
    startup_delay: Duration,
    stagger: Duration,
) {
    tokio::time::sleep(startup_delay).await;

    let device_ids = match store.devices_with_sessions() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "reconnect sweep could not list devices");
            return;
        }
    };

    if device_ids.is_empty() {
        tracing::info!("reconnect sweep found no persisted sessions");
        return;
    }

    tracing::info!(devices = device_ids.len(), "reconnect sweep starting");
    let connected = run_sweep(device_ids, stagger, |device_id| {
        let manager = manager.clone();
        async move { manager.connect(device_id).await }
    })
    .await;
    tracing::info!(connected, "reconnect sweep finished");
}
