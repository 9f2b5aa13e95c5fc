// Inbound pipeline.
//
// One call per decrypted inbound message: acknowledge, persist the Event,
// fan out delivery rows for every enabled endpoint of the tenant in the
// same transaction, and enqueue the dispatch jobs. Decryption-failure stubs
// additionally hand a reconcile signal back to the session manager, which
// evicts the sender's keys and recycles the socket.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

use gateway_shared::GatewayResult;

use crate::config::EngineSettings;
use crate::models::Device;
use crate::normalizer::{self, ContentType, RawEnvelope, STATUS_BROADCAST_JID};
use crate::queue::{
    JobOptions, JobProducer, JOB_DELIVER, JOB_SEND, OUTBOUND_MESSAGES, WEBHOOK_DISPATCH,
};
use crate::store::StateStore;
use crate::transport::{Presence, TransportHandle};

/// Delivery jobs: 5 attempts, exponential backoff from 1s.
pub const DELIVER_JOB_OPTIONS: JobOptions = JobOptions {
    max_attempts: 5,
    backoff_base_ms: 1000,
};

/// Inbound-ack sends: 3 attempts, exponential backoff from 1s.
pub const ACK_JOB_OPTIONS: JobOptions = JobOptions {
    max_attempts: 3,
    backoff_base_ms: 1000,
};

const SLOW_PROCESSING_WARN_MS: u128 = 1000;

/// Stub texts the upstream transport emits when it could not decrypt a
/// message. Observed wording; matched case-insensitively as substrings.
const DECRYPTION_FAILURE_MARKERS: [&str; 3] = [
    "no matching sessions found for message",
    "bad mac",
    "failed to decrypt message",
];

pub fn is_decryption_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    DECRYPTION_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// What the session manager should do after one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    Handled,
    /// Filtered out before normalization.
    Ignored,
    /// The peer reports desynchronized state: evict its keys and recycle
    /// the socket.
    Reconcile {
        remote_jid: String,
        sender_pn: Option<String>,
    },
}

pub async fn process_message(
    store: &Arc<dyn StateStore>,
    producer: &Arc<dyn JobProducer>,
    settings: &EngineSettings,
    device: &Device,
    handle: &TransportHandle,
    raw: Value,
) -> GatewayResult<InboundAction> {
    let started = Instant::now();

    let envelope: RawEnvelope = serde_json::from_value(raw.clone())?;
    let Some(key) = envelope.key.clone() else {
        return Ok(InboundAction::Ignored);
    };
    if key.from_me || key.remote_jid == STATUS_BROADCAST_JID || key.id.is_empty() {
        return Ok(InboundAction::Ignored);
    }

    // Best-effort acknowledgement: typing presence now, paused later, then
    // the read receipt. None of these may fail the pipeline.
    if let Err(e) = handle.send_presence(Presence::Composing, &key.remote_jid).await {
        tracing::debug!(device_id = %device.id, error = %e, "typing presence failed");
    }
    {
        let handle = handle.clone();
        let jid = key.remote_jid.clone();
        let pause_after = settings.paused_presence_after;
        tokio::spawn(async move {
            tokio::time::sleep(pause_after).await;
            let _ = handle.send_presence(Presence::Paused, &jid).await;
        });
    }
    if let Err(e) = handle.read_messages(std::slice::from_ref(&key)).await {
        tracing::debug!(device_id = %device.id, error = %e, "read receipt failed");
    }

    let own_jid = handle.authenticated_user();
    let Some(normalized) = normalizer::normalize(&envelope, own_jid.as_deref()) else {
        return Ok(InboundAction::Ignored);
    };

    // Stub path.
    if normalized.content.content_type == ContentType::Stub {
        let stub_text = normalized.content.text.clone().unwrap_or_default();
        if !is_decryption_failure(&stub_text) {
            store.touch_device_seen(device.id)?;
            return Ok(InboundAction::Handled);
        }

        tracing::warn!(
            device_id = %device.id,
            remote_jid = %normalized.remote_jid,
            stub = %stub_text,
            "decryption-failure stub, emitting event and reconciling sender state"
        );

        let mut normalized_json = serde_json::to_value(&normalized)?;
        normalized_json["decryptionFailed"] = json!(true);

        let record = store.insert_inbound_event(device.tenant_id, device.id, normalized_json, raw)?;
        enqueue_deliveries(producer, &record.deliveries).await;
        store.touch_device_seen(device.id)?;

        return Ok(InboundAction::Reconcile {
            remote_jid: normalized.remote_jid,
            sender_pn: normalized.sender_pn,
        });
    }

    // Happy path: Event + fan-out rows in one transaction, then the jobs.
    let normalized_json = serde_json::to_value(&normalized)?;
    let record = store.insert_inbound_event(device.tenant_id, device.id, normalized_json, raw)?;
    enqueue_deliveries(producer, &record.deliveries).await;

    if let Some(ack_text) = settings.inbound_ack_message.as_deref() {
        match store.insert_outbound(
            device.tenant_id,
            device.id,
            &normalized.from,
            json!({"text": ack_text}),
            false,
        ) {
            Ok(outbound) => {
                if let Err(e) = producer
                    .enqueue(
                        OUTBOUND_MESSAGES,
                        JOB_SEND,
                        json!({"outboundMessageId": outbound.id}),
                        ACK_JOB_OPTIONS,
                    )
                    .await
                {
                    tracing::error!(device_id = %device.id, error = %e, "failed to enqueue inbound ack");
                }
            }
            Err(e) => {
                tracing::error!(device_id = %device.id, error = %e, "failed to create inbound ack row");
            }
        }
    }

    store.touch_device_seen(device.id)?;

    let processing = started.elapsed();
    if processing.as_millis() > SLOW_PROCESSING_WARN_MS {
        let message_age_ms = normalized
            .timestamp
            .map(|ts| Utc::now().timestamp_millis() - ts * 1000);
        tracing::warn!(
            device_id = %device.id,
            event_id = %record.event.id,
            processing_time_ms = processing.as_millis() as u64,
            message_age_ms = ?message_age_ms,
            "slow inbound processing"
        );
    }

    Ok(InboundAction::Handled)
}

async fn enqueue_deliveries(
    producer: &Arc<dyn JobProducer>,
    deliveries: &[crate::models::WebhookDelivery],
) {
    for delivery in deliveries {
        if let Err(e) = producer
            .enqueue(
                WEBHOOK_DISPATCH,
                JOB_DELIVER,
                json!({"deliveryId": delivery.id}),
                DELIVER_JOB_OPTIONS,
            )
            .await
        {
            // The PENDING row survives; startup recovery re-enqueues it.
            tracing::error!(delivery_id = %delivery.id, error = %e, "failed to enqueue webhook delivery");
        }
    }
}
