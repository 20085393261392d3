use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::ConnectionId;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::rekey::RekeyMaster;
use crate::rpc::{encode, unknown_method, ProtocolHandler, RpcError, Shutdownable};

/// `rekey`: status and manual checks.
pub struct RekeyHandler {
    rekey: Arc<RekeyMaster>,
}

impl RekeyHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            rekey: Arc::clone(&h.state.rekey),
        }
    }
}

#[async_trait]
impl ProtocolHandler for RekeyHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "status" => encode(&self.rekey.status()),
            "check_now" => {
                self.rekey.check_now();
                Ok(json!({ "scheduled": true }))
            }
            other => Err(unknown_method("rekey", other)),
        }
    }
}

/// `delegate_ui_ctl`: lets a connection act as the rekey UI until it goes away.
pub struct DelegateUiCtlHandler {
    conn_id: ConnectionId,
    rekey: Arc<RekeyMaster>,
}

impl DelegateUiCtlHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            conn_id: h.conn_id,
            rekey: Arc::clone(&h.state.rekey),
        }
    }
}

#[async_trait]
impl ProtocolHandler for DelegateUiCtlHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "register_rekey_ui" => {
                self.rekey.register_ui(self.conn_id);
                Ok(json!({ "registered": true }))
            }
            other => Err(unknown_method("delegate_ui_ctl", other)),
        }
    }
}

impl Shutdownable for DelegateUiCtlHandler {
    fn shutdown(&self) {
        if self.rekey.unregister_ui(self.conn_id) {
            tracing::debug!(conn_id = %self.conn_id, "rekey UI released");
        }
    }
}
