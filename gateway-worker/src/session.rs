// Session manager.
//
// Process-wide registry of live chat sessions keyed by device id. Owns
// connect/disconnect, QR propagation, close policy, reconnect scheduling,
// and the per-session event loop. The registry is the authoritative
// presence view for this worker: at most one live session per device.
//
// Events for one device are handled serially by its own loop task; devices
// run concurrently. Readers (the outbound dispatcher) get handle clones and
// may observe a stale miss, never a dangling socket.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OnceCell};
use uuid::Uuid;

use gateway_shared::{GatewayError, GatewayResult};

use crate::auth_store::{AuthStateStore, LoadedAuthState};
use crate::config::EngineSettings;
use crate::inbound::{self, InboundAction};
use crate::queue::JobProducer;
use crate::store::StateStore;
use crate::transport::{
    ChatTransport, ConnectOptions, ConnectionUpdate, DisconnectReason, ProtocolVersion,
    SessionLink, TransportEvent, TransportHandle, UpsertKind,
};

struct SessionEntry {
    handle: TransportHandle,
    auth: LoadedAuthState,
    closing: bool,
}

struct Inner {
    store: Arc<dyn StateStore>,
    auth_store: Arc<AuthStateStore>,
    transport: Arc<dyn ChatTransport>,
    producer: Arc<dyn JobProducer>,
    settings: EngineSettings,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    /// Devices with a reconnect timer pending, so the close path and the
    /// desync path cannot stack two timers for one device.
    reconnecting: StdMutex<HashSet<Uuid>>,
    version: OnceCell<ProtocolVersion>,
}

/// Cheap to clone (interior `Arc`); background tasks carry their own copy.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        auth_store: Arc<AuthStateStore>,
        transport: Arc<dyn ChatTransport>,
        producer: Arc<dyn JobProducer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                auth_store,
                transport,
                producer,
                settings,
                sessions: Mutex::new(HashMap::new()),
                reconnecting: StdMutex::new(HashSet::new()),
                version: OnceCell::new(),
            }),
        }
    }

    /// Number of live sessions in this worker.
    pub async fn live_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// The outbound path's socket lookup.
    pub async fn get(&self, device_id: Uuid) -> Option<TransportHandle> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&device_id)
            .map(|entry| entry.handle.clone())
    }

    /// Open a session for the device. Idempotent: a live entry wins and the
    /// call is a no-op.
    pub async fn connect(&self, device_id: Uuid) -> GatewayResult<()> {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(&device_id) {
            tracing::debug!(device_id = %device_id, "connect ignored, session already live");
            return Ok(());
        }

        self.inner.store.mark_device_connecting(device_id)?;

        let auth = self.inner.auth_store.load(device_id);
        let version = match self
            .inner
            .version
            .get_or_try_init(|| self.inner.transport.resolve_version())
            .await
        {
            Ok(version) => *version,
            Err(e) => {
                let message = format!("connect_error: {e}");
                if let Err(e) = self.inner.store.mark_device_error(device_id, &message) {
                    tracing::error!(device_id = %device_id, error = %e, "failed to record connect error");
                }
                return Err(GatewayError::Internal(e.into()));
            }
        };

        let get_message = {
            let store = self.inner.store.clone();
            Arc::new(move |key: &crate::normalizer::MessageKey| {
                store
                    .find_raw_message(device_id, &key.id, &key.remote_jid)
                    .ok()
                    .flatten()
            })
        };

        let link = match self
            .inner
            .transport
            .connect(ConnectOptions {
                device_id,
                auth: auth.clone(),
                version,
                get_message,
            })
            .await
        {
            Ok(link) => link,
            Err(e) => {
                let message = format!("connect_error: {e}");
                tracing::error!(device_id = %device_id, error = %e, "session construction failed");
                if let Err(e) = self.inner.store.mark_device_error(device_id, &message) {
                    tracing::error!(device_id = %device_id, error = %e, "failed to record connect error");
                }
                return Err(GatewayError::Internal(e.into()));
            }
        };

        let SessionLink { handle, events } = link;
        sessions.insert(
            device_id,
            SessionEntry {
                handle: handle.clone(),
                auth: auth.clone(),
                closing: false,
            },
        );
        drop(sessions);

        tracing::info!(device_id = %device_id, "session opened, event loop starting");
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_session_loop(device_id, auth, handle, events)
                .await;
        });

        Ok(())
    }

    /// Tear a session down for good (until the next `connect` command).
    /// Safe to call on unknown devices.
    pub async fn disconnect(&self, device_id: Uuid) -> GatewayResult<()> {
        let handle = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(&device_id) {
                Some(entry) => {
                    entry.closing = true;
                    Some(entry.handle.clone())
                }
                None => None,
            }
        };

        if let Some(handle) = handle {
            handle.end().await;
            self.inner.sessions.lock().await.remove(&device_id);
            tracing::info!(device_id = %device_id, "session disconnected");
        }

        self.inner.store.mark_device_offline(device_id)?;
        Ok(())
    }

    /// `reset-sender-sessions` command: evict signal state for the given
    /// peers. A live session is purged in memory and recycled; otherwise
    /// the persisted row is rewritten out-of-band.
    pub async fn reset_sender_sessions(
        &self,
        device_id: Uuid,
        jids: &[String],
    ) -> GatewayResult<()> {
        let live = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(&device_id)
                .map(|entry| (entry.auth.clone(), entry.handle.clone()))
        };

        match live {
            Some((auth, handle)) => {
                let removed = auth.clear_sender_in_memory(jids);
                auth.save_now();
                tracing::info!(
                    device_id = %device_id,
                    removed,
                    "sender sessions reset in live session, recycling socket"
                );
                self.teardown_for_reconnect(device_id, &handle).await;
            }
            None => {
                let removed = self.inner.auth_store.clear_sessions_for_jids(device_id, jids);
                tracing::info!(device_id = %device_id, removed, "sender sessions reset out-of-band");
            }
        }
        Ok(())
    }

    // --- Event loop ---

    async fn run_session_loop(
        &self,
        device_id: Uuid,
        auth: LoadedAuthState,
        handle: TransportHandle,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::CredsUpdated => {
                    auth.save();
                }
                TransportEvent::Connection(update) => {
                    if self
                        .handle_connection_update(device_id, update, &handle)
                        .await
                    {
                        break;
                    }
                }
                TransportEvent::MessagesUpsert { kind, messages } => {
                    if kind != UpsertKind::Notify {
                        continue;
                    }
                    if self
                        .handle_notify_batch(device_id, &auth, &handle, messages)
                        .await
                    {
                        break;
                    }
                }
            }
        }
        tracing::debug!(device_id = %device_id, "session event loop ended");
    }

    /// Returns `true` when the loop should stop.
    async fn handle_connection_update(
        &self,
        device_id: Uuid,
        update: ConnectionUpdate,
        handle: &TransportHandle,
    ) -> bool {
        match update {
            ConnectionUpdate::Qr(qr) => {
                if let Err(e) = self.inner.store.mark_device_qr(device_id, &qr) {
                    tracing::error!(device_id = %device_id, error = %e, "failed to store QR");
                }
                false
            }
            ConnectionUpdate::Connecting => {
                if let Err(e) = self.inner.store.mark_device_connecting(device_id) {
                    tracing::error!(device_id = %device_id, error = %e, "failed to mark connecting");
                }
                false
            }
            ConnectionUpdate::Open => {
                if let Err(e) = self.inner.store.mark_device_online(device_id) {
                    tracing::error!(device_id = %device_id, error = %e, "failed to mark online");
                }
                match self.inner.store.expire_qr_links(device_id) {
                    Ok(expired) if expired > 0 => {
                        tracing::info!(device_id = %device_id, expired, "expired public QR links on open");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(device_id = %device_id, error = %e, "failed to expire QR links");
                    }
                }
                false
            }
            ConnectionUpdate::Close { reason } => {
                self.handle_close(device_id, reason, handle).await
            }
        }
    }

    async fn handle_close(
        &self,
        device_id: Uuid,
        reason: DisconnectReason,
        handle: &TransportHandle,
    ) -> bool {
        let description = reason.describe();
        if let Err(e) = self.inner.store.record_device_close(device_id, &description) {
            tracing::error!(device_id = %device_id, error = %e, "failed to record close reason");
        }

        let closing = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(&device_id) {
                Some(entry) if entry.handle.same_socket(handle) => {
                    let closing = entry.closing;
                    sessions.remove(&device_id);
                    closing
                }
                // A newer session already owns this device; the close
                // belongs to a socket that was replaced. Just stop.
                Some(_) => return true,
                // Entry already gone: a disconnect got there first.
                None => true,
            }
        };

        if reason.is_logged_out() {
            tracing::warn!(device_id = %device_id, "peer logged out, settling offline");
            if let Err(e) = self.inner.store.mark_device_offline(device_id) {
                tracing::error!(device_id = %device_id, error = %e, "failed to mark offline");
            }
            // The credentials are unusable now; dropping the row makes the
            // next connect command start a fresh pairing.
            if let Err(e) = self.inner.store.delete_auth_blob(device_id) {
                tracing::error!(device_id = %device_id, error = %e, "failed to drop auth state");
            }
            return true;
        }

        if closing {
            return true;
        }

        tracing::warn!(device_id = %device_id, reason = %description, "session closed, scheduling reconnect");
        self.schedule_reconnect(device_id, self.inner.settings.reconnect_close_delay);
        true
    }

    /// Returns `true` when the loop should stop (desync teardown).
    async fn handle_notify_batch(
        &self,
        device_id: Uuid,
        auth: &LoadedAuthState,
        handle: &TransportHandle,
        messages: Vec<Value>,
    ) -> bool {
        let device = match self.inner.store.get_device(device_id) {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::warn!(device_id = %device_id, "inbound for unknown device, dropping batch");
                return false;
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "device lookup failed, dropping batch");
                return false;
            }
        };

        for raw in messages {
            match inbound::process_message(
                &self.inner.store,
                &self.inner.producer,
                &self.inner.settings,
                &device,
                handle,
                raw,
            )
            .await
            {
                Ok(InboundAction::Handled) | Ok(InboundAction::Ignored) => {}
                Ok(InboundAction::Reconcile {
                    remote_jid,
                    sender_pn,
                }) => {
                    let mut jids = vec![remote_jid];
                    jids.extend(sender_pn);
                    let removed = auth.clear_sender_in_memory(&jids);
                    auth.save_now();
                    tracing::warn!(
                        device_id = %device_id,
                        removed,
                        jids = ?jids,
                        "evicted sender state after decryption failure, recycling socket"
                    );
                    self.teardown_for_reconnect(device_id, handle).await;
                    return true;
                }
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "inbound handler failed");
                    if let Err(e) = self
                        .inner
                        .store
                        .record_device_close(device_id, &e.to_string())
                    {
                        tracing::error!(device_id = %device_id, error = %e, "failed to annotate device error");
                    }
                }
            }
        }
        false
    }

    /// End the socket and schedule a fresh connect after the desync delay.
    async fn teardown_for_reconnect(&self, device_id: Uuid, handle: &TransportHandle) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(entry) = sessions.get_mut(&device_id) {
                if entry.handle.same_socket(handle) {
                    entry.closing = true;
                }
            }
        }
        handle.end().await;
        {
            let mut sessions = self.inner.sessions.lock().await;
            let ours = sessions
                .get(&device_id)
                .map(|entry| entry.handle.same_socket(handle))
                .unwrap_or(false);
            if ours {
                sessions.remove(&device_id);
            }
        }
        self.schedule_reconnect(device_id, self.inner.settings.reconnect_desync_delay);
    }

    fn schedule_reconnect(&self, device_id: Uuid, delay: Duration) {
        {
            let mut reconnecting = self.inner.reconnecting.lock().unwrap();
            if !reconnecting.insert(device_id) {
                tracing::debug!(device_id = %device_id, "reconnect already pending");
                return;
            }
        }

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager
                .inner
                .reconnecting
                .lock()
                .unwrap()
                .remove(&device_id);
            if let Err(e) = manager.connect(device_id).await {
                tracing::error!(device_id = %device_id, error = %e, "scheduled reconnect failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::models::DeviceStatus;
    use crate::queue::testing::RecordingProducer;
    use crate::queue::WEBHOOK_DISPATCH;
    use crate::store::mem::MemStore;
    use crate::transport::testing::ScriptedTransport;
    use crate::vault::Vault;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemStore>,
        producer: Arc<RecordingProducer>,
        transport: Arc<ScriptedTransport>,
        manager: SessionManager,
        tenant_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let producer = Arc::new(RecordingProducer::new());
        let transport = Arc::new(ScriptedTransport::new());
        let vault = Arc::new(Vault::new(&[3u8; 32]));
        let auth_store = Arc::new(AuthStateStore::with_debounce(
            store.clone(),
            vault,
            Duration::from_millis(10),
        ));
        let manager = SessionManager::new(
            store.clone(),
            auth_store,
            transport.clone(),
            producer.clone(),
            EngineSettings::fast(),
        );
        Fixture {
            store,
            producer,
            transport,
            manager,
            tenant_id: Uuid::new_v4(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);

        f.manager.connect(device_id).await.unwrap();
        f.manager.connect(device_id).await.unwrap();

        assert_eq!(f.transport.connects(device_id), 1);
        assert_eq!(f.manager.live_sessions().await, 1);
        assert!(f.manager.get(device_id).await.is_some());
    }

    #[tokio::test]
    async fn connect_failure_marks_device_error() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        f.transport.fail_next_connect(device_id);

        let result = f.manager.connect(device_id).await;
        assert!(result.is_err());

        let device = f.store.device(device_id).unwrap();
        assert_eq!(device.status_enum(), Some(DeviceStatus::Error));
        assert_eq!(
            device.last_error.as_deref(),
            Some("connect_error: scripted connect failure")
        );
        assert!(f.manager.get(device_id).await.is_none());
    }

    #[tokio::test]
    async fn qr_event_updates_device() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        f.transport.script_events(
            device_id,
            vec![TransportEvent::Connection(ConnectionUpdate::Qr(
                "qr-payload-1".to_string(),
            ))],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        let device = f.store.device(device_id).unwrap();
        assert_eq!(device.status_enum(), Some(DeviceStatus::Qr));
        assert_eq!(device.qr.as_deref(), Some("qr-payload-1"));
        assert!(device.last_error.is_none());
    }

    #[tokio::test]
    async fn open_marks_online_and_expires_qr_links() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        let link_id = f
            .store
            .seed_qr_link(device_id, Utc::now() + ChronoDuration::hours(24));
        f.transport.script_events(
            device_id,
            vec![TransportEvent::Connection(ConnectionUpdate::Open)],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        let device = f.store.device(device_id).unwrap();
        assert_eq!(device.status_enum(), Some(DeviceStatus::Online));
        assert!(device.qr.is_none());
        assert!(device.last_seen_at.is_some());

        let link = f.store.qr_link(link_id).unwrap();
        assert!(!link.is_valid(Utc::now()));
    }

    #[tokio::test]
    async fn close_schedules_reconnect() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        f.transport.script_events(
            device_id,
            vec![TransportEvent::Connection(ConnectionUpdate::Close {
                reason: DisconnectReason::Closed("stream errored (restart required)".into()),
            })],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        // The close was recorded and a second connect happened after the
        // 20ms test delay.
        assert_eq!(f.transport.connects(device_id), 2);
        assert_eq!(f.manager.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn logged_out_close_does_not_reconnect() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        f.store.seed_auth_blob(device_id, "v1:old:pairing:blob");
        f.transport.script_events(
            device_id,
            vec![TransportEvent::Connection(ConnectionUpdate::Close {
                reason: DisconnectReason::LoggedOut,
            })],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        assert_eq!(f.transport.connects(device_id), 1);
        assert_eq!(f.manager.live_sessions().await, 0);
        let device = f.store.device(device_id).unwrap();
        assert_eq!(device.status_enum(), Some(DeviceStatus::Offline));
        assert_eq!(device.last_error.as_deref(), Some("logged_out"));
        // The stale pairing is gone; the next connect starts fresh.
        assert!(f.store.auth_blob(device_id).is_none());
    }

    #[tokio::test]
    async fn disconnect_is_safe_and_suppresses_reconnect() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);

        // Unknown device: no-op.
        f.manager.disconnect(device_id).await.unwrap();

        f.manager.connect(device_id).await.unwrap();
        f.manager.disconnect(device_id).await.unwrap();
        settle().await;

        assert_eq!(f.manager.live_sessions().await, 0);
        assert_eq!(f.transport.connects(device_id), 1);
        let socket = f.transport.socket(device_id).unwrap();
        assert!(socket.was_ended());
        let device = f.store.device(device_id).unwrap();
        assert_eq!(device.status_enum(), Some(DeviceStatus::Offline));
    }

    #[tokio::test]
    async fn notify_batch_flows_through_inbound_pipeline() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Online);
        f.store.seed_endpoint(f.tenant_id, "whsec_1", true);
        f.store.seed_endpoint(f.tenant_id, "whsec_2", false);

        f.transport.script_events(
            device_id,
            vec![TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages: vec![json!({
                    "key": {"id": "MSG1", "remoteJid": "5491122223333@s.whatsapp.net"},
                    "message": {"conversation": "hola"},
                    "messageTimestamp": 1736900000u64,
                })],
            }],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        assert_eq!(f.store.events().len(), 1);
        assert_eq!(f.store.deliveries().len(), 1);
        assert_eq!(f.producer.jobs_for(WEBHOOK_DISPATCH).len(), 1);
        // Session stays up.
        assert_eq!(f.manager.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn non_notify_upserts_are_ignored() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Online);
        f.store.seed_endpoint(f.tenant_id, "whsec", true);

        f.transport.script_events(
            device_id,
            vec![TransportEvent::MessagesUpsert {
                kind: UpsertKind::Other,
                messages: vec![json!({
                    "key": {"id": "MSG1", "remoteJid": "1@s.whatsapp.net"},
                    "message": {"conversation": "history sync"},
                })],
            }],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        assert!(f.store.events().is_empty());
    }

    #[tokio::test]
    async fn decryption_stub_evicts_keys_and_recycles_socket() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Online);
        f.store.seed_endpoint(f.tenant_id, "whsec", true);

        f.transport.script_events(
            device_id,
            vec![TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages: vec![json!({
                    "key": {
                        "id": "STUB1",
                        "remoteJid": "67229240574002@lid",
                        "senderPn": "5491122223333@s.whatsapp.net"
                    },
                    "messageStubType": 2,
                    "messageStubParameters": ["No matching sessions found for message"],
                })],
            }],
        );

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        // The synthetic event was persisted and enqueued.
        let events = f.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].normalized_json["decryptionFailed"], json!(true));
        assert_eq!(f.producer.jobs_for(WEBHOOK_DISPATCH).len(), 1);

        // The first socket was torn down and a fresh connect happened; the
        // auth state was flushed.
        assert_eq!(f.transport.connects(device_id), 2);
        assert_eq!(f.manager.live_sessions().await, 1);
        assert!(f.store.auth_blob(device_id).is_some());
    }

    #[tokio::test]
    async fn creds_update_persists_auth_state() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);
        f.transport
            .script_events(device_id, vec![TransportEvent::CredsUpdated]);

        f.manager.connect(device_id).await.unwrap();
        settle().await;

        assert!(f.store.auth_blob(device_id).is_some());
    }

    #[tokio::test]
    async fn reset_sender_sessions_out_of_band() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Offline);

        // Not connected: nothing to do, must not panic.
        f.manager
            .reset_sender_sessions(device_id, &["123@s.whatsapp.net".to_string()])
            .await
            .unwrap();
        assert_eq!(f.transport.connects(device_id), 0);
    }

    #[tokio::test]
    async fn reset_sender_sessions_live_recycles_socket() {
        let f = fixture();
        let device_id = f.store.seed_device(f.tenant_id, DeviceStatus::Online);

        f.manager.connect(device_id).await.unwrap();
        f.manager
            .reset_sender_sessions(device_id, &["123@s.whatsapp.net".to_string()])
            .await
            .unwrap();
        settle().await;

        let socket = f.transport.socket(device_id);
        assert!(socket.is_some());
        // Reconnected after the desync delay.
        assert_eq!(f.transport.connects(device_id), 2);
        assert!(f.store.auth_blob(device_id).is_some());
    }
}
