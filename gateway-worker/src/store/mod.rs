// Persistence surface of the engine.
//
// All row mutations the worker performs go through `StateStore`, so the
// session manager, pipelines, and dispatchers stay testable without a live
// Postgres. `PgStore` is the production implementation; the in-memory
// variant lives in `mem` and only compiles for tests.

pub mod pg;

#[cfg(test)]
pub mod mem;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use gateway_shared::GatewayResult;

use crate::models::{Device, Event, NewLogRow, OutboundMessage, WebhookDelivery, WebhookEndpoint};

pub use pg::PgStore;

/// An inbound event together with its fan-out rows, created atomically.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub event: Event,
    pub deliveries: Vec<WebhookDelivery>,
}

/// Everything the webhook dispatcher needs to emit one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryBundle {
    pub delivery: WebhookDelivery,
    pub endpoint: WebhookEndpoint,
    pub event: Event,
}

pub trait StateStore: Send + Sync + 'static {
    // -- Devices --

    fn get_device(&self, id: Uuid) -> GatewayResult<Option<Device>>;

    /// A connect attempt begins: status OFFLINE, previous error cleared.
    fn mark_device_connecting(&self, id: Uuid) -> GatewayResult<()>;

    fn mark_device_qr(&self, id: Uuid, qr: &str) -> GatewayResult<()>;

    /// Session opened: status ONLINE, QR cleared, last_seen stamped.
    fn mark_device_online(&self, id: Uuid) -> GatewayResult<()>;

    fn mark_device_offline(&self, id: Uuid) -> GatewayResult<()>;

    fn mark_device_error(&self, id: Uuid, message: &str) -> GatewayResult<()>;

    /// Record the disconnect reason without touching the status; the close
    /// policy decides what happens next.
    fn record_device_close(&self, id: Uuid, message: &str) -> GatewayResult<()>;

    fn touch_device_seen(&self, id: Uuid) -> GatewayResult<()>;

    // -- QR links --

    /// Force-expire every live link for the device. Returns how many were
    /// expired.
    fn expire_qr_links(&self, device_id: Uuid) -> GatewayResult<usize>;

    // -- Auth state --

    fn load_auth_blob(&self, device_id: Uuid) -> GatewayResult<Option<String>>;

    fn save_auth_blob(&self, device_id: Uuid, auth_state_enc: &str) -> GatewayResult<()>;

    fn delete_auth_blob(&self, device_id: Uuid) -> GatewayResult<()>;

    /// Device ids with a persisted session, for the reconnect sweep.
    fn devices_with_sessions(&self) -> GatewayResult<Vec<Uuid>>;

    // -- Events + fan-out --

    /// Create the Event row and one PENDING delivery per enabled endpoint of
    /// the tenant, in a single transaction.
    fn insert_inbound_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        normalized_json: Value,
        raw_json: Value,
    ) -> GatewayResult<InboundRecord>;

    /// Search recent raw payloads for a message key (transport resend
    /// lookups).
    fn find_raw_message(
        &self,
        device_id: Uuid,
        key_id: &str,
        remote_jid: &str,
    ) -> GatewayResult<Option<Value>>;

    // -- Outbound messages --

    fn insert_outbound(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        to_jid: &str,
        payload_json: Value,
        is_test: bool,
    ) -> GatewayResult<OutboundMessage>;

    fn get_outbound(&self, id: Uuid) -> GatewayResult<Option<OutboundMessage>>;

    fn mark_outbound_processing(&self, id: Uuid) -> GatewayResult<()>;

    fn mark_outbound_sent(&self, id: Uuid, provider_message_id: &str) -> GatewayResult<()>;

    fn mark_outbound_failed(&self, id: Uuid, error: &str) -> GatewayResult<()>;

    // -- Webhook deliveries --

    fn delivery_for_dispatch(&self, id: Uuid) -> GatewayResult<Option<DeliveryBundle>>;

    /// PENDING deliveries created before `cutoff`. A crash between the
    /// fan-out commit and the enqueue leaves such rows behind; startup
    /// recovery re-enqueues them (duplicates are fine, delivery is
    /// at-least-once).
    fn stale_pending_delivery_ids(&self, cutoff: DateTime<Utc>) -> GatewayResult<Vec<Uuid>>;

    /// 2xx response: SUCCESS, attempts incremented, error and retry cleared.
    fn mark_delivery_success(&self, id: Uuid) -> GatewayResult<()>;

    fn mark_delivery_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> GatewayResult<()>;

    fn mark_delivery_dlq(&self, id: Uuid, attempts: i32, error: &str) -> GatewayResult<()>;

    // -- Logs --

    fn insert_log(&self, row: NewLogRow) -> GatewayResult<()>;
}
