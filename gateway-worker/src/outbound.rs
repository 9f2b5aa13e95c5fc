// Outbound dispatcher.
//
// Consumes `send` jobs: validates the device and socket, emits a composing
// presence, sends the text, records the provider message id. Prerequisite
// failures (missing device, offline, no socket) are terminal on the row and
// never retried; transport faults retry under the job's backoff schedule
// and the failure hook settles the row FAILED after the last attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::EngineSettings;
use crate::models::{DeviceStatus, OutboundMessage};
use crate::queue::{FailedJob, Job, JobOutcome};
use crate::session::SessionManager;
use crate::store::StateStore;
use crate::transport::Presence;

const QUEUE_WAIT_WARN: Duration = Duration::from_secs(30);
const SLOW_SEND_WARN: Duration = Duration::from_secs(5);

fn parse_outbound_id(job: &Job) -> Option<Uuid> {
    job.payload
        .get("outboundMessageId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Mark the row FAILED with the given error and stop retrying.
fn fail_terminal(
    store: &Arc<dyn StateStore>,
    outbound_id: Uuid,
    error: String,
) -> JobOutcome {
    if let Err(e) = store.mark_outbound_failed(outbound_id, &error) {
        tracing::error!(outbound_id = %outbound_id, error = %e, "failed to record outbound failure");
    }
    JobOutcome::Terminal(error)
}

pub async fn handle_send_job(
    store: &Arc<dyn StateStore>,
    manager: &SessionManager,
    settings: &EngineSettings,
    job: &Job,
) -> JobOutcome {
    let Some(outbound_id) = parse_outbound_id(job) else {
        return JobOutcome::Terminal("send job payload missing outboundMessageId".to_string());
    };

    let row: OutboundMessage = match store.get_outbound(outbound_id) {
        Ok(Some(row)) => row,
        Ok(None) => {
            // Nothing to transition; retrying cannot help.
            tracing::warn!(outbound_id = %outbound_id, "outbound row not found, dropping job");
            return JobOutcome::Ok;
        }
        Err(e) => return JobOutcome::Retry(format!("outbound lookup failed: {e}")),
    };

    if let Err(e) = store.mark_outbound_processing(outbound_id) {
        return JobOutcome::Retry(format!("failed to mark processing: {e}"));
    }

    let device = match store.get_device(row.device_id) {
        Ok(Some(device)) => device,
        Ok(None) => return fail_terminal(store, outbound_id, "device_not_found".to_string()),
        Err(e) => return JobOutcome::Retry(format!("device lookup failed: {e}")),
    };

    if device.status_enum() != Some(DeviceStatus::Online) {
        return fail_terminal(
            store,
            outbound_id,
            format!("device_not_online:{}", device.status),
        );
    }

    let Some(handle) = manager.get(row.device_id).await else {
        return fail_terminal(store, outbound_id, "device_not_connected".to_string());
    };

    if handle.authenticated_user().is_none() {
        return fail_terminal(store, outbound_id, "socket_not_authenticated".to_string());
    }

    if row.message_type != "text" {
        return fail_terminal(
            store,
            outbound_id,
            format!("unsupported_type:{}", row.message_type),
        );
    }

    let text = match row.payload_json.get("text").and_then(|v| v.as_str()) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => return JobOutcome::Retry("outbound payload has no text".to_string()),
    };

    let queue_wait = job.queue_wait();
    if queue_wait > QUEUE_WAIT_WARN {
        tracing::warn!(
            outbound_id = %outbound_id,
            device_id = %row.device_id,
            queue_wait_ms = queue_wait.as_millis() as u64,
            "outbound job waited too long in queue"
        );
    }

    // Typing indicator, a short human-feeling pause, then the text.
    let send_started = Instant::now();
    if let Err(e) = handle.send_presence(Presence::Composing, &row.to_jid).await {
        tracing::debug!(outbound_id = %outbound_id, error = %e, "composing presence failed");
    }
    tokio::time::sleep(settings.composing_before_send).await;

    let receipt = match handle.send_message(&row.to_jid, &text).await {
        Ok(receipt) => receipt,
        Err(e) => {
            // Leave PROCESSING; the failure hook settles FAILED when the
            // schedule is exhausted.
            return JobOutcome::Retry(e.to_string());
        }
    };

    if let Err(e) = handle.send_presence(Presence::Paused, &row.to_jid).await {
        tracing::debug!(outbound_id = %outbound_id, error = %e, "paused presence failed");
    }

    let send_elapsed = send_started.elapsed();
    if send_elapsed > SLOW_SEND_WARN {
        tracing::warn!(
            outbound_id = %outbound_id,
            device_id = %row.device_id,
            send_ms = send_elapsed.as_millis() as u64,
            "slow outbound send"
        );
    }

    if let Err(e) = store.mark_outbound_sent(outbound_id, &receipt.message_id) {
        return JobOutcome::Retry(format!("failed to record sent status: {e}"));
    }

    tracing::info!(
        outbound_id = %outbound_id,
        device_id = %row.device_id,
        provider_message_id = %receipt.message_id,
        "outbound message sent"
    );
    JobOutcome::Ok
}

/// Failure hook for the `outbound_messages` queue: the row settles FAILED
/// only when the schedule is exhausted (intermediate failures stay
/// PROCESSING and retry).
pub fn on_send_failure(store: &Arc<dyn StateStore>, failed: &FailedJob) {
    if failed.next_retry_in.is_some() {
        return;
    }
    let Some(outbound_id) = parse_outbound_id(&failed.job) else {
        return;
    };
    if let Err(e) = store.mark_outbound_failed(outbound_id, &failed.reason) {
        tracing::error!(outbound_id = %outbound_id, error = %e, "failed to settle outbound FAILED");
    }
}
