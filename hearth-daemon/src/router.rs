//! Fan-out of service notifications to connected clients.
//!
//! Every accepted connection is added with a closed-notifier; the router
//! forgets the connection when the notifier fires or is dropped. Clients
//! opt into channels through `notify_ctl.set_notifications`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hearth_core::{ConnectionId, Username};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::badger::BadgeState;
use crate::guard::lock;
use crate::push::MsgId;
use crate::rpc::{Outbound, RpcError};

/// Notification channels a client subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channels {
    pub session: bool,
    pub badges: bool,
    pub service: bool,
    pub push: bool,
}

impl Channels {
    pub fn all() -> Self {
        Self {
            session: true,
            badges: true,
            service: true,
            push: true,
        }
    }
}

struct Listener {
    outbound: Outbound,
    channels: Channels,
}

#[derive(Default)]
pub struct NotifyRouter {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ConnectionId, Listener>>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection until `closed` resolves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_connection(
        self: &Arc<Self>,
        outbound: Outbound,
        closed: oneshot::Receiver<RpcError>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.listeners).insert(
            id,
            Listener {
                outbound,
                channels: Channels::default(),
            },
        );

        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            match closed.await {
                Ok(err) if err.is_eof() => tracing::debug!(conn_id = %id, "connection closed"),
                Ok(err) => tracing::debug!(conn_id = %id, error = %err, "connection ended"),
                Err(_) => tracing::debug!(conn_id = %id, "connection dropped without notice"),
            }
            if let Some(router) = router.upgrade() {
                router.remove_connection(id);
            }
        });
        id
    }

    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        lock(&self.listeners).remove(&id).is_some()
    }

    /// Replace the channel set of a live connection.
    pub fn set_channels(&self, id: ConnectionId, channels: Channels) -> bool {
        match lock(&self.listeners).get_mut(&id) {
            Some(listener) => {
                listener.channels = channels;
                true
            }
            None => false,
        }
    }

    pub fn channels(&self, id: ConnectionId) -> Option<Channels> {
        lock(&self.listeners).get(&id).map(|l| l.channels)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn handle_login(&self, username: &Username) {
        self.broadcast(
            |c| c.session,
            "session.logged_in",
            json!({ "username": username }),
        );
    }

    pub fn handle_logout(&self) {
        self.broadcast(|c| c.session, "session.logged_out", Value::Null);
    }

    pub fn handle_badge_state(&self, state: &BadgeState) {
        match serde_json::to_value(state) {
            Ok(params) => self.broadcast(|c| c.badges, "badger.badge_state", params),
            Err(err) => tracing::warn!(error = %err, "failed to encode badge state"),
        }
    }

    pub fn handle_push_item(&self, category: &str, id: &MsgId) {
        self.broadcast(
            |c| c.push,
            "gregor.push_item",
            json!({ "category": category, "id": id }),
        );
    }

    pub fn handle_service_shutdown(&self) {
        self.broadcast(|c| c.service, "service.shutdown", Value::Null);
    }

    fn broadcast<F>(&self, wants: F, method: &str, params: Value)
    where
        F: Fn(&Channels) -> bool,
    {
        let targets: Vec<(ConnectionId, Outbound)> = lock(&self.listeners)
            .iter()
            .filter(|(_, l)| wants(&l.channels))
            .map(|(id, l)| (*id, l.outbound.clone()))
            .collect();
        tracing::debug!(method, listeners = targets.len(), "broadcasting notification");
        for (id, outbound) in targets {
            if outbound.notify(method, params.clone()).is_err() {
                tracing::debug!(conn_id = %id, method, "listener gone; skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Frame, Transport};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn subscribed_connection_receives_session_notifications() {
        let router = Arc::new(NotifyRouter::new());
        let (client, server_side) = duplex(4096);
        let transport = Transport::new(server_side);
        let (_closed_tx, closed_rx) = oneshot::channel();
        let id = router.add_connection(transport.outbound(), closed_rx);

        router.handle_login(&Username::from("ada"));
        assert!(router.set_channels(id, Channels::all()));
        router.handle_login(&Username::from("ada"));

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let frame: Frame = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            frame,
            Frame::notify("session.logged_in", json!({"username": "ada"}))
        );
    }

    #[tokio::test]
    async fn closed_notifier_removes_connection() {
        let router = Arc::new(NotifyRouter::new());
        let (_client, server_side) = duplex(64);
        let transport = Transport::new(server_side);
        let (closed_tx, closed_rx) = oneshot::channel();
        let id = router.add_connection(transport.outbound(), closed_rx);
        assert_eq!(router.connection_count(), 1);

        closed_tx.send(RpcError::Eof).unwrap();
        for _ in 0..10 {
            if router.connection_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(router.connection_count(), 0);
        assert!(!router.set_channels(id, Channels::all()));
    }
}
