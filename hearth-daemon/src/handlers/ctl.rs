use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::ExitCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::HandlerContext;
use crate::context::ServiceContext;
use crate::rpc::{decode_params, encode, unknown_method, ProtocolHandler, RpcError};
use crate::service_info::ServiceInfo;

/// `config`: version, runtime info and effective configuration.
pub struct ConfigHandler {
    ctx: Arc<ServiceContext>,
}

impl ConfigHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
        }
    }
}

#[async_trait]
impl ProtocolHandler for ConfigHandler {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        let config = &self.ctx.config;
        match method {
            "get_version" => Ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
            "get_service_info" => {
                let info = ServiceInfo::current(config.label(), self.ctx.fork_type, self.ctx.started_at);
                encode(&info)
            }
            "get_config" => Ok(json!({
                "label": config.label(),
                "socket_file": config.socket_path(),
                "pid_file": config.pid_path(),
                "data_dir": config.data_dir(),
                "push_uri": config.push_uri,
                "push_disabled": config.push_disabled,
                "bg_identifier_disabled": config.bg_identifier_disabled,
                "upgrade_per_user_key": config.upgrade_per_user_key,
                "critical_subsystems": self.ctx.installed(),
            })),
            other => Err(unknown_method("config", other)),
        }
    }
}

/// `ctl`: stop, restart and status of the service itself.
pub struct CtlHandler {
    ctx: Arc<ServiceContext>,
}

impl CtlHandler {
    pub fn new(h: &HandlerContext) -> Self {
        Self {
            ctx: Arc::clone(&h.ctx),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopParams {
    #[serde(default)]
    exit_code: ExitCode,
}

#[async_trait]
impl ProtocolHandler for CtlHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "stop" => {
                let StopParams { exit_code } = decode_params(params)?;
                let accepted = self.ctx.request_stop(exit_code);
                Ok(json!({ "stopping": true, "accepted": accepted, "exit_code": exit_code }))
            }
            "restart" => {
                let accepted = self.ctx.request_stop(ExitCode::Restart);
                Ok(json!({ "stopping": true, "accepted": accepted, "exit_code": ExitCode::Restart }))
            }
            "status" => Ok(json!({
                "running": true,
                "label": self.ctx.config.label(),
                "pid": std::process::id(),
                "started_at": self.ctx.started_at,
                "fork_type": self.ctx.fork_type,
                "connections": self.ctx.router.connection_count(),
                "username": self.ctx.session().map(|s| s.username),
            })),
            other => Err(unknown_method("ctl", other)),
        }
    }
}

/// `debugging`: liveness checks.
pub struct DebuggingHandler;

#[async_trait]
impl ProtocolHandler for DebuggingHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "ping" => Ok(json!({ "pong": true })),
            "echo" => Ok(params),
            other => Err(unknown_method("debugging", other)),
        }
    }
}
