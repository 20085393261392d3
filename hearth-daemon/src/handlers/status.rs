use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::rpc::{encode, unknown_method, ProtocolHandler, RpcError};
use crate::state::ServiceState;

/// `badger`: current badge counts.
pub struct BadgerHandler {
    state: Arc<ServiceState>,
}

impl BadgerHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            state: Arc::clone(&h.state),
        }
    }
}

#[async_trait]
impl ProtocolHandler for BadgerHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "get_badge_state" => encode(&self.state.badger.state()),
            other => Err(unknown_method("badger", other)),
        }
    }
}

/// `chat_local`: whether the chat pipeline is running, and for whom.
pub struct ChatLocalHandler {
    state: Arc<ServiceState>,
}

impl ChatLocalHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            state: Arc::clone(&h.state),
        }
    }
}

#[async_trait]
impl ProtocolHandler for ChatLocalHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "status" => Ok(match self.state.chat() {
                Some(chat) => json!({
                    "created": true,
                    "running_for": chat.running_for(),
                    "loops": chat.loop_names(),
                }),
                None => json!({ "created": false, "running_for": null, "loops": [] }),
            }),
            other => Err(unknown_method("chat_local", other)),
        }
    }
}
