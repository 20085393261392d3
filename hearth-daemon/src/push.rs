//! Push notification client and reachability.
//!
//! The client keeps one outbound connection to the push server, dialed from
//! an `fmp://` (or `fmprpc://`) URI. Items injected locally are delivered to
//! registered [`PushHandler`]s, fanned out through the notify router and
//! forwarded upstream when connected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::DaemonError;
use crate::guard::{lock, read, write};
use crate::router::NotifyRouter;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Unknown,
    Yes,
    No,
}

/// Last known connectivity to the push server.
pub struct Reachability {
    state: watch::Sender<Connectivity>,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new()
    }
}

impl Reachability {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Connectivity::Unknown);
        Self { state }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn set(&self, connectivity: Connectivity) {
        let changed = self.state.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if changed {
            tracing::info!(?connectivity, "reachability changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(pub String);

impl MsgId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushItem {
    pub id: MsgId,
    pub category: String,
    pub body: String,
}

/// Message forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushMessage {
    Item(PushItem),
    Dismiss { id: MsgId },
    OutOfBand { system: String, body: String },
}

/// Consumer of push traffic. Callbacks must not block.
pub trait PushHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_item(&self, _item: &PushItem) {}

    fn on_dismiss(&self, _id: &MsgId) {}

    fn on_out_of_band(&self, _system: &str, _body: &str) {}
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Parsed push server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushUri {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl PushUri {
    pub fn parse(raw: &str) -> Result<Self, DaemonError> {
        let invalid = |why: &str| DaemonError::Push(format!("invalid push URI '{raw}': {why}"));
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let tls = match scheme {
            "fmp" => false,
            "fmprpc+tls" => true,
            "fmprpc" => false,
            _ => return Err(invalid("unsupported scheme")),
        };
        let authority = rest.trim_end_matches('/');
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        Ok(Self {
            tls,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PushUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "fmprpc+tls" } else { "fmp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait PushConnection: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), DaemonError>;
    async fn close(&self);
}

#[async_trait]
pub trait PushDialer: Send + Sync {
    async fn dial(&self, uri: &PushUri) -> Result<Box<dyn PushConnection>, DaemonError>;
}

/// Plain TCP dialer speaking newline-delimited JSON.
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl PushDialer for TcpDialer {
    async fn dial(&self, uri: &PushUri) -> Result<Box<dyn PushConnection>, DaemonError> {
        if uri.tls {
            return Err(DaemonError::Push(format!("TLS push transport not available for {uri}")));
        }
        let addr = format!("{}:{}", uri.host, uri.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DaemonError::Push(format!("timed out connecting to {uri}")))?
            .map_err(|e| DaemonError::Push(format!("connect to {uri} failed: {e}")))?;
        let (reader, writer) = stream.into_split();
        Ok(Box::new(TcpPushConnection {
            _reader: reader,
            writer: tokio::sync::Mutex::new(writer),
        }))
    }
}

struct TcpPushConnection {
    _reader: OwnedReadHalf,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl PushConnection for TcpPushConnection {
    async fn send(&self, message: &PushMessage) -> Result<(), DaemonError> {
        let mut payload = serde_json::to_vec(message)?;
        payload.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&payload)
            .await
            .map_err(|e| DaemonError::Push(format!("push write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| DaemonError::Push(format!("push flush failed: {e}")))
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PushClient {
    dialer: Arc<dyn PushDialer>,
    router: Arc<NotifyRouter>,
    reachability: RwLock<Option<Arc<Reachability>>>,
    handlers: RwLock<Vec<Arc<dyn PushHandler>>>,
    conn: tokio::sync::Mutex<Option<Box<dyn PushConnection>>>,
    items: Mutex<BTreeMap<MsgId, PushItem>>,
    connected: AtomicBool,
    shut_down: AtomicBool,
}

impl PushClient {
    pub fn new(dialer: Arc<dyn PushDialer>, router: Arc<NotifyRouter>) -> Self {
        Self {
            dialer,
            router,
            reachability: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            conn: tokio::sync::Mutex::new(None),
            items: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn set_reachability(&self, reachability: Arc<Reachability>) {
        *write(&self.reachability) = Some(reachability);
    }

    pub fn add_handler(&self, handler: Arc<dyn PushHandler>) {
        tracing::debug!(handler = handler.name(), "push handler added");
        write(&self.handlers).push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        read(&self.handlers).iter().map(|h| h.name()).collect()
    }

    /// Dial `uri`, replacing any existing connection. Clears a prior shutdown.
    pub async fn connect(&self, uri: &PushUri) -> Result<(), DaemonError> {
        let mut conn = self.conn.lock().await;
        if let Some(old) = conn.take() {
            old.close().await;
        }
        match self.dialer.dial(uri).await {
            Ok(fresh) => {
                *conn = Some(fresh);
                self.connected.store(true, Ordering::SeqCst);
                self.shut_down.store(false, Ordering::SeqCst);
                self.set_connectivity(Connectivity::Yes);
                tracing::info!(uri = %uri, "push client connected");
                Ok(())
            }
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                self.set_connectivity(Connectivity::No);
                Err(err)
            }
        }
    }

    /// Drop the current connection without marking the client shut down.
    pub async fn reset(&self) {
        if let Some(old) = self.conn.lock().await.take() {
            old.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Disconnect and refuse further calls until the next [`Self::connect`].
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.reset().await;
        self.set_connectivity(Connectivity::No);
        tracing::debug!("push client shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn items(&self) -> Vec<PushItem> {
        lock(&self.items).values().cloned().collect()
    }

    pub async fn inject_item(&self, category: &str, body: &str) -> Result<MsgId, DaemonError> {
        self.ensure_live()?;
        let item = PushItem {
            id: MsgId::generate(),
            category: category.to_string(),
            body: body.to_string(),
        };
        lock(&self.items).insert(item.id.clone(), item.clone());
        for handler in self.handlers() {
            handler.on_item(&item);
        }
        self.router.handle_push_item(&item.category, &item.id);
        let id = item.id.clone();
        self.forward(PushMessage::Item(item)).await;
        Ok(id)
    }

    pub async fn dismiss_item(&self, id: &MsgId) -> Result<(), DaemonError> {
        self.ensure_live()?;
        if lock(&self.items).remove(id).is_none() {
            return Err(DaemonError::Push(format!("unknown push item {id}")));
        }
        for handler in self.handlers() {
            handler.on_dismiss(id);
        }
        self.forward(PushMessage::Dismiss { id: id.clone() }).await;
        Ok(())
    }

    pub async fn inject_out_of_band(&self, system: &str, body: &str) -> Result<(), DaemonError> {
        self.ensure_live()?;
        for handler in self.handlers() {
            handler.on_out_of_band(system, body);
        }
        self.forward(PushMessage::OutOfBand {
            system: system.to_string(),
            body: body.to_string(),
        })
        .await;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), DaemonError> {
        if self.is_shut_down() {
            return Err(DaemonError::Push("push client is shut down".to_string()));
        }
        Ok(())
    }

    fn handlers(&self) -> Vec<Arc<dyn PushHandler>> {
        read(&self.handlers).clone()
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        if let Some(reachability) = read(&self.reachability).as_ref() {
            reachability.set(connectivity);
        }
    }

    async fn forward(&self, message: PushMessage) {
        let mut conn = self.conn.lock().await;
        let Some(active) = conn.as_ref() else {
            return;
        };
        if let Err(err) = active.send(&message).await {
            tracing::warn!(error = %err, "push forward failed; dropping connection");
            if let Some(broken) = conn.take() {
                broken.close().await;
            }
            self.connected.store(false, Ordering::SeqCst);
            self.set_connectivity(Connectivity::No);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryDialer;
    use super::*;

    #[test]
    fn parses_push_uris() {
        let uri = PushUri::parse("fmp://127.0.0.1:9911").unwrap();
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, 9911);
        assert!(!uri.tls);
        assert!(PushUri::parse("fmprpc+tls://push.example.org:443/").unwrap().tls);
        assert!(PushUri::parse("https://push.example.org:443").is_err());
        assert!(PushUri::parse("fmp://push.example.org").is_err());
    }

    #[tokio::test]
    async fn connect_failure_marks_unreachable() {
        let dialer = Arc::new(MemoryDialer::default());
        dialer.refuse.store(true, Ordering::SeqCst);
        let client = PushClient::new(dialer, Arc::new(NotifyRouter::new()));
        let reachability = Arc::new(Reachability::new());
        client.set_reachability(Arc::clone(&reachability));

        let uri = PushUri::parse("fmp://127.0.0.1:9911").unwrap();
        assert!(client.connect(&uri).await.is_err());
        assert!(!client.is_connected());
        assert_eq!(reachability.current(), Connectivity::No);
    }

    #[tokio::test]
    async fn injected_items_are_forwarded_and_dismissable() {
        let dialer = Arc::new(MemoryDialer::default());
        let sent = Arc::clone(&dialer.sent);
        let client = PushClient::new(dialer, Arc::new(NotifyRouter::new()));
        client
            .connect(&PushUri::parse("fmp://127.0.0.1:9911").unwrap())
            .await
            .unwrap();

        let id = client.inject_item("kbfs.favorites", "{}").await.unwrap();
        assert_eq!(client.items().len(), 1);
        client.dismiss_item(&id).await.unwrap();
        assert!(client.dismiss_item(&id).await.is_err());
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn calls_fail_after_shutdown_until_reconnect() {
        let dialer = Arc::new(MemoryDialer::default());
        let client = PushClient::new(dialer, Arc::new(NotifyRouter::new()));
        client.shutdown().await;

        let err = client.inject_out_of_band("kbfs.rekey", "").await.unwrap_err();
        assert!(err.to_string().contains("push client is shut down"));

        client
            .connect(&PushUri::parse("fmp://127.0.0.1:9911").unwrap())
            .await
            .unwrap();
        client.inject_out_of_band("kbfs.rekey", "").await.unwrap();
    }
}
