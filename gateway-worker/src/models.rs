use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{
    devices, events, logs, outbound_messages, public_qr_links, tenants, wa_sessions,
    webhook_deliveries, webhook_endpoints,
};

// --- Status enums ---
//
// Status columns are plain varchars in the store; these enums are the
// Rust-side vocabulary with a stable string form on both sides.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Offline,
    Qr,
    Online,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Qr => "QR",
            Self::Online => "ONLINE",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(Self::Offline),
            "QR" => Some(Self::Qr),
            "ONLINE" => Some(Self::Online),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Dlq,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Dlq => "DLQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "DLQ" => Some(Self::Dlq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundStatus {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "PROCESSING" => Some(Self::Processing),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// The only event type the worker currently emits.
pub const EVENT_MESSAGE_INBOUND: &str = "message.inbound";

// --- Tenant ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

// --- Device ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = devices)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    pub phone_hint: Option<String>,
    pub status: String,
    pub qr: Option<String>,
    pub last_error: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn status_enum(&self) -> Option<DeviceStatus> {
        DeviceStatus::parse(&self.status)
    }
}

// --- WaSession ---

#[derive(Debug, Queryable, Identifiable, Clone)]
#[diesel(table_name = wa_sessions)]
pub struct WaSession {
    pub id: Uuid,
    pub device_id: Uuid,
    pub auth_state_enc: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = wa_sessions)]
pub struct NewWaSession<'a> {
    pub device_id: Uuid,
    pub auth_state_enc: &'a str,
}

// --- WebhookEndpoint ---

#[derive(Debug, Queryable, Identifiable, Clone)]
#[diesel(table_name = webhook_endpoints)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

// --- Event ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub event_type: String,
    pub normalized_json: Value,
    pub raw_json: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub event_type: String,
    pub normalized_json: Value,
    pub raw_json: Value,
}

// --- WebhookDelivery ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = webhook_deliveries)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn status_enum(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_deliveries)]
pub struct NewWebhookDelivery {
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub attempts: i32,
}

// --- OutboundMessage ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = outbound_messages)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub to_jid: String,
    pub message_type: String,
    pub payload_json: Value,
    pub is_test: bool,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn status_enum(&self) -> Option<OutboundStatus> {
        OutboundStatus::parse(&self.status)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbound_messages)]
pub struct NewOutboundMessage {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub to_jid: String,
    pub message_type: String,
    pub payload_json: Value,
    pub is_test: bool,
    pub status: String,
}

// --- PublicQrLink ---

#[derive(Debug, Queryable, Identifiable, Clone)]
#[diesel(table_name = public_qr_links)]
pub struct PublicQrLink {
    pub id: Uuid,
    pub device_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PublicQrLink {
    /// A link is valid while `now <= expires_at`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

// --- Log ---

#[derive(Debug, Queryable, Identifiable, Clone)]
#[diesel(table_name = logs)]
pub struct LogRow {
    pub id: Uuid,
    pub level: String,
    pub service: String,
    pub message: String,
    pub error: Option<String>,
    pub metadata: Option<Value>,
    pub tenant_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = logs)]
pub struct NewLogRow {
    pub level: String,
    pub service: String,
    pub message: String,
    pub error: Option<String>,
    pub metadata: Option<Value>,
    pub tenant_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_string_round_trips() {
        for s in [
            DeviceStatus::Offline,
            DeviceStatus::Qr,
            DeviceStatus::Online,
            DeviceStatus::Error,
        ] {
            assert_eq!(DeviceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DeviceStatus::parse("BOGUS"), None);

        for s in [
            DeliveryStatus::Pending,
            DeliveryStatus::Success,
            DeliveryStatus::Failed,
            DeliveryStatus::Dlq,
        ] {
            assert_eq!(DeliveryStatus::parse(s.as_str()), Some(s));
        }

        for s in [
            OutboundStatus::Queued,
            OutboundStatus::Processing,
            OutboundStatus::Sent,
            OutboundStatus::Failed,
        ] {
            assert_eq!(OutboundStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn qr_link_validity_window() {
        let now = Utc::now();
        let link = PublicQrLink {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            token: "ab".repeat(32),
            expires_at: now + Duration::hours(24),
            created_at: now,
        };
        assert!(link.is_valid(now));
        assert!(link.is_valid(now + Duration::hours(24)));
        assert!(!link.is_valid(now + Duration::hours(25)));
    }
}
