//! Runtime info file (`service.json`) read by other processes to find the
//! running service.

use std::path::Path;

use chrono::{DateTime, Utc};
use hearth_core::ForkType;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub version: String,
    pub label: String,
    pub pid: u32,
    pub fork_type: ForkType,
    pub started_at: DateTime<Utc>,
}

impl ServiceInfo {
    pub fn current(label: &str, fork_type: ForkType, started_at: DateTime<Utc>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            label: label.to_string(),
            pid: std::process::id(),
            fork_type,
            started_at,
        }
    }
}

/// Write `info` to `path` atomically.
pub fn write(path: &Path, info: &ServiceInfo) -> Result<(), DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let json = serde_json::to_string_pretty(info)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

/// Read the info file, `None` when absent.
pub fn read(path: &Path) -> Result<Option<ServiceInfo>, DaemonError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}
