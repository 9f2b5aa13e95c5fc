use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use gateway_shared::clients::db::DbPool;
use gateway_shared::{GatewayError, GatewayResult};

use crate::models::{
    Device, Event, NewEvent, NewLogRow, NewOutboundMessage, NewWaSession, NewWebhookDelivery,
    OutboundMessage, OutboundStatus, WebhookDelivery, WebhookEndpoint,
};
use crate::models::{DeliveryStatus, DeviceStatus, EVENT_MESSAGE_INBOUND};
use crate::schema::{
    devices, events, logs, outbound_messages, public_qr_links, wa_sessions, webhook_deliveries,
    webhook_endpoints,
};
use crate::store::{DeliveryBundle, InboundRecord, StateStore};

/// How far back `find_raw_message` scans for transport resend lookups.
const RAW_LOOKUP_WINDOW: i64 = 50;

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> GatewayResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>>
    {
        self.pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to get db connection");
            GatewayError::from(e)
        })
    }
}

impl StateStore for PgStore {
    fn get_device(&self, id: Uuid) -> GatewayResult<Option<Device>> {
        let mut conn = self.conn()?;
        let device = devices::table
            .find(id)
            .first::<Device>(&mut conn)
            .optional()?;
        Ok(device)
    }

    fn mark_device_connecting(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::status.eq(DeviceStatus::Offline.as_str()),
                devices::last_error.eq(None::<String>),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_device_qr(&self, id: Uuid, qr: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::status.eq(DeviceStatus::Qr.as_str()),
                devices::qr.eq(Some(qr)),
                devices::last_error.eq(None::<String>),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_device_online(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::status.eq(DeviceStatus::Online.as_str()),
                devices::qr.eq(None::<String>),
                devices::last_error.eq(None::<String>),
                devices::last_seen_at.eq(Some(Utc::now())),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_device_offline(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::status.eq(DeviceStatus::Offline.as_str()),
                devices::qr.eq(None::<String>),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_device_error(&self, id: Uuid, message: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::status.eq(DeviceStatus::Error.as_str()),
                devices::last_error.eq(Some(message)),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn record_device_close(&self, id: Uuid, message: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set((
                devices::last_error.eq(Some(message)),
                devices::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn touch_device_seen(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(devices::table.find(id))
            .set(devices::last_seen_at.eq(Some(Utc::now())))
            .execute(&mut conn)?;
        Ok(())
    }

    fn expire_qr_links(&self, device_id: Uuid) -> GatewayResult<usize> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let expired = diesel::update(
            public_qr_links::table
                .filter(public_qr_links::device_id.eq(device_id))
                .filter(public_qr_links::expires_at.gt(now)),
        )
        .set(public_qr_links::expires_at.eq(now))
        .execute(&mut conn)?;
        Ok(expired)
    }

    fn load_auth_blob(&self, device_id: Uuid) -> GatewayResult<Option<String>> {
        let mut conn = self.conn()?;
        let blob = wa_sessions::table
            .filter(wa_sessions::device_id.eq(device_id))
            .select(wa_sessions::auth_state_enc)
            .first::<String>(&mut conn)
            .optional()?;
        Ok(blob)
    }

    fn save_auth_blob(&self, device_id: Uuid, auth_state_enc: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(wa_sessions::table)
            .values(&NewWaSession {
                device_id,
                auth_state_enc,
            })
            .on_conflict(wa_sessions::device_id)
            .do_update()
            .set((
                wa_sessions::auth_state_enc.eq(auth_state_enc),
                wa_sessions::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn delete_auth_blob(&self, device_id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::delete(wa_sessions::table.filter(wa_sessions::device_id.eq(device_id)))
            .execute(&mut conn)?;
        Ok(())
    }

    fn devices_with_sessions(&self) -> GatewayResult<Vec<Uuid>> {
        let mut conn = self.conn()?;
        let ids = wa_sessions::table
            .select(wa_sessions::device_id)
            .order(wa_sessions::updated_at.asc())
            .load::<Uuid>(&mut conn)?;
        Ok(ids)
    }

    fn insert_inbound_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        normalized_json: Value,
        raw_json: Value,
    ) -> GatewayResult<InboundRecord> {
        let mut conn = self.conn()?;

        let record = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let event = diesel::insert_into(events::table)
                .values(&NewEvent {
                    tenant_id,
                    device_id,
                    event_type: EVENT_MESSAGE_INBOUND.to_string(),
                    normalized_json,
                    raw_json,
                })
                .get_result::<Event>(conn)?;

            let endpoints = webhook_endpoints::table
                .filter(webhook_endpoints::tenant_id.eq(tenant_id))
                .filter(webhook_endpoints::enabled.eq(true))
                .order(webhook_endpoints::created_at.asc())
                .load::<WebhookEndpoint>(conn)?;

            let rows: Vec<NewWebhookDelivery> = endpoints
                .iter()
                .map(|endpoint| NewWebhookDelivery {
                    endpoint_id: endpoint.id,
                    event_id: event.id,
                    status: DeliveryStatus::Pending.as_str().to_string(),
                    attempts: 0,
                })
                .collect();

            let deliveries = if rows.is_empty() {
                Vec::new()
            } else {
                diesel::insert_into(webhook_deliveries::table)
                    .values(&rows)
                    .get_results::<WebhookDelivery>(conn)?
            };

            Ok(InboundRecord { event, deliveries })
        })?;

        Ok(record)
    }

    fn find_raw_message(
        &self,
        device_id: Uuid,
        key_id: &str,
        remote_jid: &str,
    ) -> GatewayResult<Option<Value>> {
        let mut conn = self.conn()?;
        let recent = events::table
            .filter(events::device_id.eq(device_id))
            .order(events::created_at.desc())
            .limit(RAW_LOOKUP_WINDOW)
            .select(events::raw_json)
            .load::<Value>(&mut conn)?;

        Ok(recent.into_iter().find(|raw| {
            raw.pointer("/key/id").and_then(Value::as_str) == Some(key_id)
                && raw.pointer("/key/remoteJid").and_then(Value::as_str) == Some(remote_jid)
        }))
    }

    fn insert_outbound(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        to_jid: &str,
        payload_json: Value,
        is_test: bool,
    ) -> GatewayResult<OutboundMessage> {
        let mut conn = self.conn()?;
        let row = diesel::insert_into(outbound_messages::table)
            .values(&NewOutboundMessage {
                tenant_id,
                device_id,
                to_jid: to_jid.to_string(),
                message_type: "text".to_string(),
                payload_json,
                is_test,
                status: OutboundStatus::Queued.as_str().to_string(),
            })
            .get_result::<OutboundMessage>(&mut conn)?;
        Ok(row)
    }

    fn get_outbound(&self, id: Uuid) -> GatewayResult<Option<OutboundMessage>> {
        let mut conn = self.conn()?;
        let row = outbound_messages::table
            .find(id)
            .first::<OutboundMessage>(&mut conn)
            .optional()?;
        Ok(row)
    }

    fn mark_outbound_processing(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(outbound_messages::table.find(id))
            .set(outbound_messages::status.eq(OutboundStatus::Processing.as_str()))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_outbound_sent(&self, id: Uuid, provider_message_id: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(outbound_messages::table.find(id))
            .set((
                outbound_messages::status.eq(OutboundStatus::Sent.as_str()),
                outbound_messages::provider_message_id.eq(Some(provider_message_id)),
                outbound_messages::error.eq(None::<String>),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_outbound_failed(&self, id: Uuid, error: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(outbound_messages::table.find(id))
            .set((
                outbound_messages::status.eq(OutboundStatus::Failed.as_str()),
                outbound_messages::error.eq(Some(error)),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn delivery_for_dispatch(&self, id: Uuid) -> GatewayResult<Option<DeliveryBundle>> {
        let mut conn = self.conn()?;
        let bundle = webhook_deliveries::table
            .inner_join(webhook_endpoints::table)
            .inner_join(events::table)
            .filter(webhook_deliveries::id.eq(id))
            .first::<(WebhookDelivery, WebhookEndpoint, Event)>(&mut conn)
            .optional()?;

        Ok(bundle.map(|(delivery, endpoint, event)| DeliveryBundle {
            delivery,
            endpoint,
            event,
        }))
    }

    fn stale_pending_delivery_ids(&self, cutoff: DateTime<Utc>) -> GatewayResult<Vec<Uuid>> {
        let mut conn = self.conn()?;
        let ids = webhook_deliveries::table
            .filter(webhook_deliveries::status.eq(DeliveryStatus::Pending.as_str()))
            .filter(webhook_deliveries::created_at.lt(cutoff))
            .order(webhook_deliveries::created_at.asc())
            .select(webhook_deliveries::id)
            .load::<Uuid>(&mut conn)?;
        Ok(ids)
    }

    fn mark_delivery_success(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(webhook_deliveries::table.find(id))
            .set((
                webhook_deliveries::status.eq(DeliveryStatus::Success.as_str()),
                webhook_deliveries::attempts.eq(webhook_deliveries::attempts + 1),
                webhook_deliveries::last_error.eq(None::<String>),
                webhook_deliveries::next_retry_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_delivery_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(webhook_deliveries::table.find(id))
            .set((
                webhook_deliveries::status.eq(DeliveryStatus::Failed.as_str()),
                webhook_deliveries::attempts.eq(attempts),
                webhook_deliveries::last_error.eq(Some(error)),
                webhook_deliveries::next_retry_at.eq(Some(next_retry_at)),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_delivery_dlq(&self, id: Uuid, attempts: i32, error: &str) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::update(webhook_deliveries::table.find(id))
            .set((
                webhook_deliveries::status.eq(DeliveryStatus::Dlq.as_str()),
                webhook_deliveries::attempts.eq(attempts),
                webhook_deliveries::last_error.eq(Some(error)),
                webhook_deliveries::next_retry_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn insert_log(&self, row: NewLogRow) -> GatewayResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(logs::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(())
    }
}
