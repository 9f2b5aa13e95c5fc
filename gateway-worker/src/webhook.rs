// Webhook dispatcher.
//
// Consumes `deliver` jobs: loads the delivery with its endpoint and event,
// signs the canonical JSON body, POSTs it, and settles the delivery row.
// Signing is HMAC-SHA256 over `{timestamp}.{body}` (timestamp-prefixed to
// prevent replay), hex-encoded in the `x-signature` header. Receivers
// should reject requests older than a few minutes and must be idempotent:
// delivery is at-least-once.
//
// Retry policy lives in the job envelope (5 attempts, exponential backoff
// from 1s). The failure hook runs on every failed attempt: intermediate
// ones settle FAILED with a `next_retry_at`, the last one moves the row to
// DLQ.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::Event;
use crate::queue::{FailedJob, Job, JobOutcome};
use crate::store::{DeliveryBundle, StateStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BODY_SNIPPET: usize = 200;

type HmacSha256 = Hmac<Sha256>;

/// Compute the delivery signature: hex HMAC-SHA256 of `{timestamp}.{body}`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature (constant-time comparison).
#[allow(dead_code)]
pub fn verify_signature(secret: &str, timestamp: &str, body: &str, signature: &str) -> bool {
    let expected = sign_payload(secret, timestamp, body);
    use subtle::ConstantTimeEq;
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    event_id: Uuid,
    tenant_id: Uuid,
    device_id: Uuid,
    #[serde(rename = "type")]
    event_type: &'a str,
    normalized: &'a Value,
    raw: &'a Value,
    created_at: String,
}

/// Canonical UTF-8 JSON body for one event. The byte sequence is what gets
/// signed, so field order and timestamp format are part of the contract.
pub fn build_body(event: &Event) -> String {
    let body = WebhookBody {
        event_id: event.id,
        tenant_id: event.tenant_id,
        device_id: event.device_id,
        event_type: &event.event_type,
        normalized: &event.normalized_json,
        raw: &event.raw_json,
        created_at: event
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    serde_json::to_string(&body).expect("webhook body serialization cannot fail")
}

pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build webhook http client")
}

fn parse_delivery_id(job: &Job) -> Option<Uuid> {
    job.payload
        .get("deliveryId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

pub async fn handle_deliver_job(
    store: &Arc<dyn StateStore>,
    http: &reqwest::Client,
    job: &Job,
) -> JobOutcome {
    let Some(delivery_id) = parse_delivery_id(job) else {
        return JobOutcome::Terminal("deliver job payload missing deliveryId".to_string());
    };

    let bundle = match store.delivery_for_dispatch(delivery_id) {
        Ok(Some(bundle)) => bundle,
        Ok(None) => {
            tracing::warn!(delivery_id = %delivery_id, "delivery row gone, dropping job");
            return JobOutcome::Ok;
        }
        Err(e) => return JobOutcome::Retry(format!("delivery lookup failed: {e}")),
    };
    let DeliveryBundle {
        delivery,
        endpoint,
        event,
    } = bundle;

    if !endpoint.enabled {
        tracing::info!(
            delivery_id = %delivery_id,
            endpoint_id = %endpoint.id,
            "endpoint disabled, skipping delivery"
        );
        return JobOutcome::Ok;
    }

    let body = build_body(&event);
    let timestamp = Utc::now().timestamp_millis().to_string();
    let signature = sign_payload(&endpoint.secret, &timestamp, &body);

    let response = http
        .post(&endpoint.url)
        .header("content-type", "application/json")
        .header("x-event-id", event.id.to_string())
        .header("x-tenant-id", event.tenant_id.to_string())
        .header("x-device-id", event.device_id.to_string())
        .header("x-event-type", &event.event_type)
        .header("x-timestamp", &timestamp)
        .header("x-signature", &signature)
        .body(body)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            if let Err(e) = store.mark_delivery_success(delivery.id) {
                return JobOutcome::Retry(format!("failed to record delivery success: {e}"));
            }
            tracing::info!(
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                event_id = %event.id,
                status = response.status().as_u16(),
                "webhook delivered"
            );
            JobOutcome::Ok
        }
        Ok(response) => {
            let status = response.status().as_u16();
            let snippet: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(ERROR_BODY_SNIPPET)
                .collect();
            JobOutcome::Retry(format!("HTTP {status}: {snippet}"))
        }
        Err(e) => JobOutcome::Retry(format!("request failed: {e}")),
    }
}

/// Failure hook for the `webhook_dispatch` queue, run on every failed
/// attempt. `failed.job.attempt` already counts this attempt.
pub fn on_deliver_failure(store: &Arc<dyn StateStore>, failed: &FailedJob) {
    let Some(delivery_id) = parse_delivery_id(&failed.job) else {
        return;
    };
    let attempts = failed.job.attempt as i32;

    let result = match failed.next_retry_in {
        Some(delay) => {
            let next_retry_at =
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            store.mark_delivery_retry(delivery_id, attempts, &failed.reason, next_retry_at)
        }
        None => store.mark_delivery_dlq(delivery_id, attempts, &failed.reason),
    };
    if let Err(e) = result {
        tracing::error!(delivery_id = %delivery_id, error = %e, "failed to settle delivery status");
    }
}
