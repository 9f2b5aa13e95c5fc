// Auth-state store.
//
// Backs the transport's authentication-state abstraction: an opaque creds
// object plus typed key buckets, persisted as one encrypted row per device.
// Key rotation is chatty, so `save` debounces with a trailing timer and
// `save_now` flushes on the spots that must not be lost (sender-key
// eviction, logout).
//
// Save failures are logged and never propagate; a device that cannot
// persist still keeps serving its live session. Load failures fall back to
// fresh credentials, which is equivalent to an unpaired device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::normalizer::user_part;
use crate::store::StateStore;
use crate::vault::Vault;

const SAVE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Key bucket kinds the transport reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketKind {
    #[serde(rename = "session")]
    Session,
    #[serde(rename = "sender-key")]
    SenderKey,
    #[serde(rename = "sender-key-memory")]
    SenderKeyMemory,
    #[serde(rename = "pre-key")]
    PreKey,
    #[serde(rename = "app-state-sync-key")]
    AppStateSyncKey,
}

impl BucketKind {
    pub const ALL: [BucketKind; 5] = [
        Self::Session,
        Self::SenderKey,
        Self::SenderKeyMemory,
        Self::PreKey,
        Self::AppStateSyncKey,
    ];

    /// Buckets wiped by `clear_corrupted` after a reported desync.
    const CORRUPTIBLE: [BucketKind; 3] =
        [Self::Session, Self::SenderKey, Self::SenderKeyMemory];

    /// Buckets holding per-sender group keys, purged by substring.
    const SENDER_KEYED: [BucketKind; 2] = [Self::SenderKey, Self::SenderKeyMemory];
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthData {
    creds: Value,
    keys: HashMap<BucketKind, HashMap<String, Value>>,
}

impl AuthData {
    fn fresh() -> Self {
        Self {
            creds: json!({}),
            keys: HashMap::new(),
        }
    }
}

struct AuthInner {
    device_id: Uuid,
    store: Arc<dyn StateStore>,
    vault: Arc<Vault>,
    data: Mutex<AuthData>,
    save_generation: AtomicU64,
    debounce: Duration,
}

/// The loaded authentication state for one device.
///
/// Cheap to clone; the session manager hands one copy to the transport and
/// keeps another for eviction and teardown paths. Exactly one live session
/// per device exists, so writers never race across processes.
#[derive(Clone)]
pub struct LoadedAuthState {
    inner: Arc<AuthInner>,
}

impl LoadedAuthState {
    pub fn device_id(&self) -> Uuid {
        self.inner.device_id
    }

    pub fn creds(&self) -> Value {
        self.inner.data.lock().unwrap().creds.clone()
    }

    /// Replace the opaque credential object (transport `creds.update`).
    pub fn set_creds(&self, creds: Value) {
        self.inner.data.lock().unwrap().creds = creds;
    }

    /// Key-store facade read: the subset of `ids` present in the bucket.
    pub fn get(&self, kind: BucketKind, ids: &[String]) -> HashMap<String, Value> {
        let data = self.inner.data.lock().unwrap();
        let Some(bucket) = data.keys.get(&kind) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| bucket.get(id).map(|v| (id.clone(), v.clone())))
            .collect()
    }

    /// Key-store facade write: `Some` upserts, `None` deletes. Returns
    /// whether anything actually changed; a real change schedules a
    /// debounced save.
    pub fn set(&self, updates: HashMap<BucketKind, HashMap<String, Option<Value>>>) -> bool {
        let mut changed = false;
        {
            let mut data = self.inner.data.lock().unwrap();
            for (kind, entries) in updates {
                let bucket = data.keys.entry(kind).or_default();
                for (id, value) in entries {
                    match value {
                        Some(value) => {
                            let replaced = bucket.insert(id, value.clone());
                            if replaced.as_ref() != Some(&value) {
                                changed = true;
                            }
                        }
                        None => {
                            if bucket.remove(&id).is_some() {
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
        if changed {
            self.save();
        }
        changed
    }

    /// Schedule a trailing save. Repeated calls within the window collapse
    /// into one write, fired after the last call.
    pub fn save(&self) {
        let generation = self.inner.save_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            if inner.save_generation.load(Ordering::SeqCst) == generation {
                persist(&inner);
            }
        });
    }

    /// Flush immediately and cancel any pending timer.
    pub fn save_now(&self) {
        self.inner.save_generation.fetch_add(1, Ordering::SeqCst);
        persist(&self.inner);
    }

    /// Drop every entry in the desync-prone buckets, then flush.
    pub fn clear_corrupted(&self) {
        {
            let mut data = self.inner.data.lock().unwrap();
            for kind in BucketKind::CORRUPTIBLE {
                data.keys.remove(&kind);
            }
        }
        self.save_now();
    }

    /// Evict the signal state held for the given peers, then let the caller
    /// decide when to flush. Returns how many entries were dropped.
    pub fn clear_sender_in_memory(&self, jids: &[String]) -> usize {
        let mut data = self.inner.data.lock().unwrap();
        purge_jids(&mut data.keys, jids)
    }
}

fn persist(inner: &AuthInner) {
    let serialized = {
        let data = inner.data.lock().unwrap();
        serde_json::to_vec(&*data)
    };
    let plaintext = match serialized {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(device_id = %inner.device_id, error = %e, "auth state serialization failed");
            return;
        }
    };

    let token = inner.vault.encrypt(&plaintext);
    if let Err(e) = inner.store.save_auth_blob(inner.device_id, &token) {
        tracing::error!(device_id = %inner.device_id, error = %e, "auth state save failed");
    }
}

/// Remove session entries for the user parts of `jids`.
///
/// Session buckets match on the exact id plus its `:device` and `.resource`
/// forms; sender-key buckets match any key containing the user part.
fn purge_jids(
    buckets: &mut HashMap<BucketKind, HashMap<String, Value>>,
    jids: &[String],
) -> usize {
    let parts: Vec<String> = jids
        .iter()
        .map(|jid| user_part(jid).to_string())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return 0;
    }

    let mut removed = 0;

    if let Some(bucket) = buckets.get_mut(&BucketKind::Session) {
        let before = bucket.len();
        bucket.retain(|id, _| {
            !parts.iter().any(|part| {
                id == part
                    || id.starts_with(&format!("{part}:"))
                    || id.starts_with(&format!("{part}."))
            })
        });
        removed += before - bucket.len();
    }

    for kind in BucketKind::SENDER_KEYED {
        if let Some(bucket) = buckets.get_mut(&kind) {
            let before = bucket.len();
            bucket.retain(|id, _| !parts.iter().any(|part| id.contains(part.as_str())));
            removed += before - bucket.len();
        }
    }

    removed
}

/// Loader and out-of-band maintenance for persisted auth rows.
pub struct AuthStateStore {
    store: Arc<dyn StateStore>,
    vault: Arc<Vault>,
    debounce: Duration,
}

impl AuthStateStore {
    pub fn new(store: Arc<dyn StateStore>, vault: Arc<Vault>) -> Self {
        Self {
            store,
            vault,
            debounce: SAVE_DEBOUNCE,
        }
    }

    #[cfg(test)]
    pub fn with_debounce(
        store: Arc<dyn StateStore>,
        vault: Arc<Vault>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            vault,
            debounce,
        }
    }

    /// Load (or initialize) the device's auth state.
    pub fn load(&self, device_id: Uuid) -> LoadedAuthState {
        let data = match self.store.load_auth_blob(device_id) {
            Ok(Some(token)) => match self.decode(&token) {
                Some(data) => data,
                None => {
                    tracing::warn!(
                        device_id = %device_id,
                        "auth state undecipherable, starting fresh pairing"
                    );
                    AuthData::fresh()
                }
            },
            Ok(None) => AuthData::fresh(),
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "auth state load failed, starting fresh");
                AuthData::fresh()
            }
        };

        LoadedAuthState {
            inner: Arc::new(AuthInner {
                device_id,
                store: self.store.clone(),
                vault: self.vault.clone(),
                data: Mutex::new(data),
                save_generation: AtomicU64::new(0),
                debounce: self.debounce,
            }),
        }
    }

    /// Out-of-band variant of sender eviction: rewrite the persisted row
    /// directly, without touching any live session's memory. Used by the
    /// `reset-sender-sessions` command when the device is not connected.
    pub fn clear_sessions_for_jids(&self, device_id: Uuid, jids: &[String]) -> usize {
        let Ok(Some(token)) = self.store.load_auth_blob(device_id) else {
            return 0;
        };
        let Some(mut data) = self.decode(&token) else {
            return 0;
        };

        let removed = purge_jids(&mut data.keys, jids);
        if removed == 0 {
            return 0;
        }

        match serde_json::to_vec(&data) {
            Ok(plaintext) => {
                let token = self.vault.encrypt(&plaintext);
                if let Err(e) = self.store.save_auth_blob(device_id, &token) {
                    tracing::error!(device_id = %device_id, error = %e, "sender session rewrite failed");
                }
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "sender session serialization failed");
            }
        }
        removed
    }

    fn decode(&self, token: &str) -> Option<AuthData> {
        let plaintext = self.vault.decrypt(token).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}
