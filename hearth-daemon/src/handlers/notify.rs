use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::ConnectionId;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::rpc::{decode_params, unknown_method, ProtocolHandler, RpcError, Shutdownable};
use crate::router::{Channels, NotifyRouter};

/// `notify_ctl`: channel subscriptions for this connection.
pub struct NotifyCtlHandler {
    conn_id: ConnectionId,
    router: Arc<NotifyRouter>,
}

impl NotifyCtlHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            conn_id: h.conn_id,
            router: Arc::clone(&h.ctx.router),
        }
    }
}

#[async_trait]
impl ProtocolHandler for NotifyCtlHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "set_notifications" => {
                let channels: Channels = decode_params(params)?;
                let live = self.router.set_channels(self.conn_id, channels);
                Ok(json!({ "subscribed": live, "channels": channels }))
            }
            other => Err(unknown_method("notify_ctl", other)),
        }
    }
}

impl Shutdownable for NotifyCtlHandler {
    fn shutdown(&self) {
        self.router.set_channels(self.conn_id, Channels::default());
    }
}
