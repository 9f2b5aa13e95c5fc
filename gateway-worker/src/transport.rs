// Chat transport seam.
//
// The concrete protocol library stays outside this crate; the engine
// consumes it through `ChatTransport` (socket construction) and a typed
// event stream per session. Sockets are shared as cheap `TransportHandle`
// clones so readers never hold references that outlive the session.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth_store::LoadedAuthState;
use crate::normalizer::MessageKey;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("socket is not open")]
    NotOpen,
}

/// Why a session closed, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer unlinked this device; reconnecting is pointless until a new
    /// pairing.
    LoggedOut,
    Closed(String),
}

impl DisconnectReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::LoggedOut => "logged_out".to_string(),
            Self::Closed(message) => message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Other,
}

#[derive(Debug, Clone)]
pub enum ConnectionUpdate {
    Qr(String),
    Connecting,
    Open,
    Close { reason: DisconnectReason },
}

/// Tagged transport events, delivered serially per device.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    CredsUpdated,
    Connection(ConnectionUpdate),
    MessagesUpsert { kind: UpsertKind, messages: Vec<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

pub type ProtocolVersion = (u32, u32);

/// Lookup used by the transport to re-fetch a previously observed raw
/// message (retry/resend flows).
pub type GetMessageFn = Arc<dyn Fn(&MessageKey) -> Option<Value> + Send + Sync>;

pub struct ConnectOptions {
    pub device_id: Uuid,
    pub auth: LoadedAuthState,
    pub version: ProtocolVersion,
    pub get_message: GetMessageFn,
}

/// A freshly connected session: the command surface plus its event stream.
pub struct SessionLink {
    pub handle: TransportHandle,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub trait TransportSocket: Send + Sync {
    /// The authenticated user principal, once the session is open.
    fn authenticated_user(&self) -> Option<String>;

    fn send_message<'a>(
        &'a self,
        to: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<SendReceipt, TransportError>>;

    fn send_presence<'a>(
        &'a self,
        presence: Presence,
        jid: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn read_messages<'a>(&'a self, keys: &'a [MessageKey])
        -> BoxFuture<'a, Result<(), TransportError>>;

    fn end(&self) -> BoxFuture<'_, ()>;
}

/// Cloneable command surface of one live session.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<dyn TransportSocket>,
}

impl TransportHandle {
    pub fn new(socket: Arc<dyn TransportSocket>) -> Self {
        Self { inner: socket }
    }

    /// Whether two handles refer to the same underlying socket. Lets the
    /// session registry ignore close events from sockets it has already
    /// replaced.
    pub fn same_socket(&self, other: &TransportHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn authenticated_user(&self) -> Option<String> {
        self.inner.authenticated_user()
    }

    pub async fn send_message(
        &self,
        to: &str,
        text: &str,
    ) -> Result<SendReceipt, TransportError> {
        self.inner.send_message(to, text).await
    }

    pub async fn send_presence(
        &self,
        presence: Presence,
        jid: &str,
    ) -> Result<(), TransportError> {
        self.inner.send_presence(presence, jid).await
    }

    pub async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), TransportError> {
        self.inner.read_messages(keys).await
    }

    pub async fn end(&self) {
        self.inner.end().await
    }
}

pub trait ChatTransport: Send + Sync + 'static {
    /// Resolve the protocol version to connect with. Cached by the caller.
    fn resolve_version(&self) -> BoxFuture<'_, Result<ProtocolVersion, TransportError>>;

    fn connect(&self, options: ConnectOptions)
        -> BoxFuture<'_, Result<SessionLink, TransportError>>;
}
