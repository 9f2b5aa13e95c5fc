// In-memory `StateStore` used by unit tests. Mirrors the Postgres
// implementation's semantics closely enough to exercise the engine's state
// transitions without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use gateway_shared::GatewayResult;

use crate::models::{
    DeliveryStatus, Device, DeviceStatus, Event, LogRow, NewLogRow, OutboundMessage,
    OutboundStatus, PublicQrLink, WebhookDelivery, WebhookEndpoint, EVENT_MESSAGE_INBOUND,
};
use crate::store::{DeliveryBundle, InboundRecord, StateStore};

#[derive(Default)]
struct MemState {
    devices: HashMap<Uuid, Device>,
    endpoints: Vec<WebhookEndpoint>,
    qr_links: Vec<PublicQrLink>,
    auth_blobs: HashMap<Uuid, String>,
    events: Vec<Event>,
    deliveries: Vec<WebhookDelivery>,
    outbound: HashMap<Uuid, OutboundMessage>,
    outbound_order: Vec<Uuid>,
    logs: Vec<LogRow>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Seeding --

    pub fn seed_device(&self, tenant_id: Uuid, status: DeviceStatus) -> Uuid {
        let id = Uuid::new_v4();
        let device = Device {
            id,
            tenant_id,
            label: format!("device-{id}"),
            phone_hint: None,
            status: status.as_str().to_string(),
            qr: None,
            last_error: None,
            last_seen_at: None,
            updated_at: Utc::now(),
        };
        self.state.lock().unwrap().devices.insert(id, device);
        id
    }

    pub fn seed_endpoint(&self, tenant_id: Uuid, secret: &str, enabled: bool) -> Uuid {
        let id = Uuid::new_v4();
        let endpoint = WebhookEndpoint {
            id,
            tenant_id,
            url: format!("https://hooks.example/{id}"),
            secret: secret.to_string(),
            enabled,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().endpoints.push(endpoint);
        id
    }

    pub fn seed_qr_link(&self, device_id: Uuid, expires_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let link = PublicQrLink {
            id,
            device_id,
            token: "ab".repeat(32),
            expires_at,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().qr_links.push(link);
        id
    }

    pub fn seed_auth_blob(&self, device_id: Uuid, blob: &str) {
        self.state
            .lock()
            .unwrap()
            .auth_blobs
            .insert(device_id, blob.to_string());
    }

    pub fn seed_delivery(&self, endpoint_id: Uuid, event_id: Uuid, attempts: i32) -> Uuid {
        let id = Uuid::new_v4();
        let delivery = WebhookDelivery {
            id,
            endpoint_id,
            event_id,
            status: DeliveryStatus::Pending.as_str().to_string(),
            attempts,
            last_error: None,
            next_retry_at: None,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().deliveries.push(delivery);
        id
    }

    // -- Probes --

    pub fn device(&self, id: Uuid) -> Option<Device> {
        self.state.lock().unwrap().devices.get(&id).cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn deliveries(&self) -> Vec<WebhookDelivery> {
        self.state.lock().unwrap().deliveries.clone()
    }

    pub fn delivery(&self, id: Uuid) -> Option<WebhookDelivery> {
        self.state
            .lock()
            .unwrap()
            .deliveries
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    pub fn outbound_rows(&self) -> Vec<OutboundMessage> {
        let state = self.state.lock().unwrap();
        state
            .outbound_order
            .iter()
            .filter_map(|id| state.outbound.get(id).cloned())
            .collect()
    }

    pub fn qr_link(&self, id: Uuid) -> Option<PublicQrLink> {
        self.state
            .lock()
            .unwrap()
            .qr_links
            .iter()
            .find(|l| l.id == id)
            .cloned()
    }

    pub fn auth_blob(&self, device_id: Uuid) -> Option<String> {
        self.state.lock().unwrap().auth_blobs.get(&device_id).cloned()
    }

    pub fn logs(&self) -> Vec<LogRow> {
        self.state.lock().unwrap().logs.clone()
    }

    fn update_device(&self, id: Uuid, f: impl FnOnce(&mut Device)) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&id) {
            f(device);
            device.updated_at = Utc::now();
        }
    }

    fn update_delivery(&self, id: Uuid, f: impl FnOnce(&mut WebhookDelivery)) {
        let mut state = self.state.lock().unwrap();
        if let Some(delivery) = state.deliveries.iter_mut().find(|d| d.id == id) {
            f(delivery);
        }
    }

    fn update_outbound(&self, id: Uuid, f: impl FnOnce(&mut OutboundMessage)) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.outbound.get_mut(&id) {
            f(row);
        }
    }
}

impl StateStore for MemStore {
    fn get_device(&self, id: Uuid) -> GatewayResult<Option<Device>> {
        Ok(self.device(id))
    }

    fn mark_device_connecting(&self, id: Uuid) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.status = DeviceStatus::Offline.as_str().to_string();
            d.last_error = None;
        });
        Ok(())
    }

    fn mark_device_qr(&self, id: Uuid, qr: &str) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.status = DeviceStatus::Qr.as_str().to_string();
            d.qr = Some(qr.to_string());
            d.last_error = None;
        });
        Ok(())
    }

    fn mark_device_online(&self, id: Uuid) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.status = DeviceStatus::Online.as_str().to_string();
            d.qr = None;
            d.last_error = None;
            d.last_seen_at = Some(Utc::now());
        });
        Ok(())
    }

    fn mark_device_offline(&self, id: Uuid) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.status = DeviceStatus::Offline.as_str().to_string();
            d.qr = None;
        });
        Ok(())
    }

    fn mark_device_error(&self, id: Uuid, message: &str) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.status = DeviceStatus::Error.as_str().to_string();
            d.last_error = Some(message.to_string());
        });
        Ok(())
    }

    fn record_device_close(&self, id: Uuid, message: &str) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.last_error = Some(message.to_string());
        });
        Ok(())
    }

    fn touch_device_seen(&self, id: Uuid) -> GatewayResult<()> {
        self.update_device(id, |d| {
            d.last_seen_at = Some(Utc::now());
        });
        Ok(())
    }

    fn expire_qr_links(&self, device_id: Uuid) -> GatewayResult<usize> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let mut expired = 0;
        for link in state
            .qr_links
            .iter_mut()
            .filter(|l| l.device_id == device_id && l.expires_at > now)
        {
            link.expires_at = now;
            expired += 1;
        }
        Ok(expired)
    }

    fn load_auth_blob(&self, device_id: Uuid) -> GatewayResult<Option<String>> {
        Ok(self.auth_blob(device_id))
    }

    fn save_auth_blob(&self, device_id: Uuid, auth_state_enc: &str) -> GatewayResult<()> {
        self.state
            .lock()
            .unwrap()
            .auth_blobs
            .insert(device_id, auth_state_enc.to_string());
        Ok(())
    }

    fn delete_auth_blob(&self, device_id: Uuid) -> GatewayResult<()> {
        self.state.lock().unwrap().auth_blobs.remove(&device_id);
        Ok(())
    }

    fn devices_with_sessions(&self) -> GatewayResult<Vec<Uuid>> {
        Ok(self.state.lock().unwrap().auth_blobs.keys().copied().collect())
    }

    fn insert_inbound_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        normalized_json: Value,
        raw_json: Value,
    ) -> GatewayResult<InboundRecord> {
        let mut state = self.state.lock().unwrap();
        let event = Event {
            id: Uuid::now_v7(),
            tenant_id,
            device_id,
            event_type: EVENT_MESSAGE_INBOUND.to_string(),
            normalized_json,
            raw_json,
            created_at: Utc::now(),
        };
        state.events.push(event.clone());

        let mut deliveries = Vec::new();
        for endpoint in state
            .endpoints
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.enabled)
        {
            deliveries.push(WebhookDelivery {
                id: Uuid::now_v7(),
                endpoint_id: endpoint.id,
                event_id: event.id,
                status: DeliveryStatus::Pending.as_str().to_string(),
                attempts: 0,
                last_error: None,
                next_retry_at: None,
                created_at: Utc::now(),
            });
        }
        state.deliveries.extend(deliveries.clone());

        Ok(InboundRecord { event, deliveries })
    }

    fn find_raw_message(
        &self,
        device_id: Uuid,
        key_id: &str,
        remote_jid: &str,
    ) -> GatewayResult<Option<Value>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .map(|e| &e.raw_json)
            .find(|raw| {
                raw.pointer("/key/id").and_then(Value::as_str) == Some(key_id)
                    && raw.pointer("/key/remoteJid").and_then(Value::as_str) == Some(remote_jid)
            })
            .cloned())
    }

    fn insert_outbound(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        to_jid: &str,
        payload_json: Value,
        is_test: bool,
    ) -> GatewayResult<OutboundMessage> {
        let row = OutboundMessage {
            id: Uuid::now_v7(),
            tenant_id,
            device_id,
            to_jid: to_jid.to_string(),
            message_type: "text".to_string(),
            payload_json,
            is_test,
            status: OutboundStatus::Queued.as_str().to_string(),
            provider_message_id: None,
            error: None,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        state.outbound_order.push(row.id);
        state.outbound.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_outbound(&self, id: Uuid) -> GatewayResult<Option<OutboundMessage>> {
        Ok(self.state.lock().unwrap().outbound.get(&id).cloned())
    }

    fn mark_outbound_processing(&self, id: Uuid) -> GatewayResult<()> {
        self.update_outbound(id, |row| {
            row.status = OutboundStatus::Processing.as_str().to_string();
        });
        Ok(())
    }

    fn mark_outbound_sent(&self, id: Uuid, provider_message_id: &str) -> GatewayResult<()> {
        self.update_outbound(id, |row| {
            row.status = OutboundStatus::Sent.as_str().to_string();
            row.provider_message_id = Some(provider_message_id.to_string());
            row.error = None;
        });
        Ok(())
    }

    fn mark_outbound_failed(&self, id: Uuid, error: &str) -> GatewayResult<()> {
        self.update_outbound(id, |row| {
            row.status = OutboundStatus::Failed.as_str().to_string();
            row.error = Some(error.to_string());
        });
        Ok(())
    }

    fn delivery_for_dispatch(&self, id: Uuid) -> GatewayResult<Option<DeliveryBundle>> {
        let state = self.state.lock().unwrap();
        let Some(delivery) = state.deliveries.iter().find(|d| d.id == id).cloned() else {
            return Ok(None);
        };
        let Some(endpoint) = state
            .endpoints
            .iter()
            .find(|e| e.id == delivery.endpoint_id)
            .cloned()
        else {
            return Ok(None);
        };
        let Some(event) = state
            .events
            .iter()
            .find(|e| e.id == delivery.event_id)
            .cloned()
        else {
            return Ok(None);
        };
        Ok(Some(DeliveryBundle {
            delivery,
            endpoint,
            event,
        }))
    }

    fn stale_pending_delivery_ids(&self, cutoff: DateTime<Utc>) -> GatewayResult<Vec<Uuid>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Pending.as_str() && d.created_at < cutoff)
            .map(|d| d.id)
            .collect())
    }

    fn mark_delivery_success(&self, id: Uuid) -> GatewayResult<()> {
        self.update_delivery(id, |d| {
            d.status = DeliveryStatus::Success.as_str().to_string();
            d.attempts += 1;
            d.last_error = None;
            d.next_retry_at = None;
        });
        Ok(())
    }

    fn mark_delivery_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.update_delivery(id, |d| {
            d.status = DeliveryStatus::Failed.as_str().to_string();
            d.attempts = attempts;
            d.last_error = Some(error.to_string());
            d.next_retry_at = Some(next_retry_at);
        });
        Ok(())
    }

    fn mark_delivery_dlq(&self, id: Uuid, attempts: i32, error: &str) -> GatewayResult<()> {
        self.update_delivery(id, |d| {
            d.status = DeliveryStatus::Dlq.as_str().to_string();
            d.attempts = attempts;
            d.last_error = Some(error.to_string());
            d.next_retry_at = None;
        });
        Ok(())
    }

    fn insert_log(&self, row: NewLogRow) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        let row = LogRow {
            id: Uuid::now_v7(),
            level: row.level,
            service: row.service,
            message: row.message,
            error: row.error,
            metadata: row.metadata,
            tenant_id: row.tenant_id,
            device_id: row.device_id,
            created_at: Utc::now(),
        };
        state.logs.push(row);
        Ok(())
    }
}
