use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::Username;
use serde::Deserialize;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::context::ServiceContext;
use crate::rpc::{decode_params, encode, unknown_method, ProtocolHandler, RpcError};
use crate::state::ServiceState;
use crate::transitions;

/// `login`: explicit login and logout.
pub struct LoginHandler {
    ctx: Arc<ServiceContext>,
}

impl LoginHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    username: String,
}

#[async_trait]
impl ProtocolHandler for LoginHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "login" => {
                let LoginParams { username } = decode_params(params)?;
                if username.trim().is_empty() {
                    return Err(RpcError::InvalidParams("username must not be empty".to_string()));
                }
                let ctx = Arc::clone(&self.ctx);
                detached(async move {
                    let session = ctx
                        .collaborators
                        .auth
                        .login(&Username::from(username))
                        .await
                        .map_err(|e| RpcError::Handler(e.to_string()))?;
                    ctx.login(session.clone()).await;
                    encode(&session)
                })
                .await
            }
            "logout" => {
                let ctx = Arc::clone(&self.ctx);
                detached(async move {
                    ctx.collaborators
                        .auth
                        .logout()
                        .await
                        .map_err(|e| RpcError::Handler(e.to_string()))?;
                    ctx.logout().await;
                    Ok(json!({ "logged_out": true }))
                })
                .await
            }
            other => Err(unknown_method("login", other)),
        }
    }
}

/// Run a session transition on its own task. The connection's calls are
/// aborted when the client hangs up; a login or logout must still run to
/// the end once it has begun.
async fn detached<F>(work: F) -> Result<Value, RpcError>
where
    F: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| RpcError::Handler(format!("session transition failed: {e}")))?
}

/// `session`: the current session.
pub struct SessionHandler {
    ctx: Arc<ServiceContext>,
}

impl SessionHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
        }
    }
}

#[async_trait]
impl ProtocolHandler for SessionHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "current_session" => match self.ctx.session() {
                Some(session) => encode(&session),
                None => Err(RpcError::Handler("not logged in".to_string())),
            },
            other => Err(unknown_method("session", other)),
        }
    }
}

/// `identify`: on-demand self identify.
pub struct IdentifyHandler {
    ctx: Arc<ServiceContext>,
}

impl IdentifyHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
        }
    }
}

#[async_trait]
impl ProtocolHandler for IdentifyHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "identify_self" => {
                let loaded = transitions::identify_self(&self.ctx)
                    .await
                    .map_err(|e| RpcError::Handler(e.to_string()))?;
                Ok(json!({ "full_self": loaded }))
            }
            other => Err(unknown_method("identify", other)),
        }
    }
}

/// `user`: per-user background work.
pub struct UserHandler {
    state: Arc<ServiceState>,
}

impl UserHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            state: Arc::clone(&h.state),
        }
    }
}

#[async_trait]
impl ProtocolHandler for UserHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "key_upgrade_wake" => {
                let woken = match self.state.key_upgrade() {
                    Some(task) => {
                        task.wake();
                        true
                    }
                    None => false,
                };
                Ok(json!({ "woken": woken }))
            }
            other => Err(unknown_method("user", other)),
        }
    }
}
