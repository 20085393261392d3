use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::context::ServiceContext;
use crate::push::{MsgId, PushClient};
use crate::rpc::{decode_params, unknown_method, ProtocolHandler, RpcError};
use crate::state::ServiceState;
use crate::transitions;

/// `gregor`: the push client facade.
pub struct GregorHandler {
    ctx: Arc<ServiceContext>,
    state: Arc<ServiceState>,
}

impl GregorHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
            state: Arc::clone(&h.state),
        }
    }

    fn client(&self) -> Result<Arc<PushClient>, RpcError> {
        self.state
            .push()
            .ok_or_else(|| RpcError::Handler("push notifications are disabled".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DismissParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct InjectParams {
    category: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct OutOfBandParams {
    system: String,
    #[serde(default)]
    body: String,
}

fn handler_err(err: crate::error::DaemonError) -> RpcError {
    RpcError::Handler(err.to_string())
}

#[async_trait]
impl ProtocolHandler for GregorHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "dismiss_item" => {
                let DismissParams { id } = decode_params(params)?;
                self.client()?.dismiss_item(&MsgId(id)).await.map_err(handler_err)?;
                Ok(json!({ "dismissed": true }))
            }
            "inject_item" => {
                let InjectParams { category, body } = decode_params(params)?;
                let id = self
                    .client()?
                    .inject_item(&category, &body)
                    .await
                    .map_err(handler_err)?;
                Ok(json!({ "id": id }))
            }
            "inject_out_of_band" => {
                let OutOfBandParams { system, body } = decode_params(params)?;
                self.client()?
                    .inject_out_of_band(&system, &body)
                    .await
                    .map_err(handler_err)?;
                Ok(json!({ "delivered": true }))
            }
            "is_connected" => Ok(json!({ "connected": self.client()?.is_connected() })),
            "reconnect" => {
                self.client()?;
                transitions::push_connect(&self.ctx, &self.state)
                    .await
                    .map_err(handler_err)?;
                Ok(json!({ "connected": true }))
            }
            other => Err(unknown_method("gregor", other)),
        }
    }
}

/// `reachability`: last known connectivity to the push server.
pub struct ReachabilityHandler {
    state: Arc<ServiceState>,
}

impl ReachabilityHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            state: Arc::clone(&h.state),
        }
    }
}

#[async_trait]
impl ProtocolHandler for ReachabilityHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "check" | "start_reachability" => {
                Ok(json!({ "reachable": self.state.reachability.current() }))
            }
            other => Err(unknown_method("reachability", other)),
        }
    }
}
