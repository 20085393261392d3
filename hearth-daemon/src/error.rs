use std::path::PathBuf;

use thiserror::Error;

use crate::rpc::RpcError;

/// Error surface for the service runtime, its subsystems, and the client helpers.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] hearth_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("another service instance is already running (lock held: {path})")]
    AlreadyRunning { path: PathBuf },

    #[error("store {path} is corrupt: {source}")]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("push error: {0}")]
    Push(String),

    #[error("{subsystem}: {message}")]
    Subsystem {
        subsystem: &'static str,
        message: String,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("service protocol error: {0}")]
    Protocol(String),

    #[error("service is not running (socket missing: {socket})")]
    ServiceNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn subsystem_err(subsystem: &'static str, message: impl Into<String>) -> DaemonError {
    DaemonError::Subsystem {
        subsystem,
        message: message.into(),
    }
}
