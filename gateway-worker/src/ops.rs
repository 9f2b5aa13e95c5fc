// Operational shell.
//
// Health endpoint, heartbeat, the database log trail, the crash classifier
// and the best-effort crash alert. The classifier keeps the process alive
// through routine transport noise and reserves exit(1) for faults a
// supervisor restart can actually help with.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::models::{LogLevel, NewLogRow};
use crate::store::StateStore;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const ALERT_BUDGET: Duration = Duration::from_secs(5);

/// Transport/network error signatures that are routine: log and carry on.
const BENIGN_TRANSPORT_MARKERS: [&str; 7] = [
    "terminated",
    "other side closed",
    "ECONNRESET",
    "socket hang up",
    "UND_ERR_SOCKET",
    "ECONNREFUSED",
    "ETIMEDOUT",
];

/// Decryption-desync signatures surfaced outside the message path. Logged
/// as session-sync incidents; the actual reconciliation happens through the
/// stub handling on the next inbound message.
const SESSION_SYNC_MARKERS: [&str; 5] = [
    "Over 2000 messages into the future",
    "SessionError",
    "Failed to decrypt message",
    "Invalid patch mac",
    "Bad MAC",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Routine transport noise; keep the process alive.
    BenignTransport,
    /// Session desync signature; log an incident, reconciliation follows on
    /// the next message.
    SessionSync,
    /// Everything else: alert and exit so a supervisor restarts us.
    Fatal,
}

pub fn classify_fault(message: &str) -> FaultClass {
    let lower = message.to_lowercase();
    if BENIGN_TRANSPORT_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
    {
        return FaultClass::BenignTransport;
    }
    if SESSION_SYNC_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
    {
        return FaultClass::SessionSync;
    }
    FaultClass::Fatal
}

// --- Health endpoint ---

async fn health_handler() -> Json<Value> {
    Json(json!({"ok": true, "service": "worker"}))
}

pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_health(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "health endpoint listening");
    axum::serve(listener, health_router()).await?;
    Ok(())
}

// --- Heartbeat ---

pub async fn heartbeat_loop() {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        tracing::info!("worker heartbeat");
    }
}

// --- Database log trail ---

/// Writes WARN/ERROR rows to the `logs` table alongside the tracing output.
/// A failing database never takes the logger down; it falls back to
/// tracing only.
#[derive(Clone)]
pub struct DbLogger {
    store: Arc<dyn StateStore>,
}

impl DbLogger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn warn(
        &self,
        message: &str,
        error: Option<&str>,
        metadata: Option<Value>,
        tenant_id: Option<Uuid>,
        device_id: Option<Uuid>,
    ) {
        self.write(LogLevel::Warn, message, error, metadata, tenant_id, device_id);
    }

    pub fn error(
        &self,
        message: &str,
        error: Option<&str>,
        metadata: Option<Value>,
        tenant_id: Option<Uuid>,
        device_id: Option<Uuid>,
    ) {
        self.write(LogLevel::Error, message, error, metadata, tenant_id, device_id);
    }

    fn write(
        &self,
        level: LogLevel,
        message: &str,
        error: Option<&str>,
        metadata: Option<Value>,
        tenant_id: Option<Uuid>,
        device_id: Option<Uuid>,
    ) {
        let row = NewLogRow {
            level: level.as_str().to_string(),
            service: "worker".to_string(),
            message: message.to_string(),
            error: error.map(str::to_string),
            metadata,
            tenant_id,
            device_id,
        };
        if let Err(e) = self.store.insert_log(row) {
            tracing::error!(error = %e, original_message = %message, "db log write failed");
        }
    }
}

// --- Crash alert ---

/// Best-effort alert before a fatal exit: one POST with a hard time budget.
/// The process exits regardless of the outcome.
pub async fn send_crash_alert(http: &reqwest::Client, alert_url: &str, message: &str) {
    let payload = json!({"service": "worker", "message": message});
    let attempt = tokio::time::timeout(
        ALERT_BUDGET,
        http.post(alert_url).json(&payload).send(),
    )
    .await;

    match attempt {
        Ok(Ok(response)) => {
            tracing::info!(status = response.status().as_u16(), "crash alert posted");
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "crash alert failed");
        }
        Err(_) => {
            tracing::error!("crash alert timed out");
        }
    }
}

/// Classify an escaped fault and decide whether the process survives.
/// Returns `true` when the caller must exit(1).
pub fn handle_escaped_fault(db_logger: &DbLogger, message: &str) -> bool {
    match classify_fault(message) {
        FaultClass::BenignTransport => {
            tracing::warn!(error = %message, "benign transport error, continuing");
            false
        }
        FaultClass::SessionSync => {
            tracing::warn!(error = %message, "session-sync incident");
            db_logger.warn("session-sync incident", Some(message), None, None, None);
            false
        }
        FaultClass::Fatal => {
            tracing::error!(error = %message, "unclassified fault, exiting for supervisor restart");
            db_logger.error("worker fatal fault", Some(message), None, None, None);
            true
        }
    }
}
