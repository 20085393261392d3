//! Default on-disk layout.
//!
//! ```text
//! ~/.hearth/
//!   config.yaml
//!   run/
//!     hearth.sock       (RPC socket, mode 0600)
//!     hearth.pid        (exclusive lock + pid)
//!     service.json      (runtime info for other processes)
//!   data/
//!     local.json        (key-value store)
//!     chat.json         (chat store)
//!     session.json
//!   logs/
//!     service.log
//! ```
//!
//! Every configured path in [`crate::Config`] overrides the matching default.

use std::path::{Path, PathBuf};

pub const SERVICE_LABEL: &str = "dev.hearth.service";

pub const CONFIG_FILE: &str = "config.yaml";
pub const SOCKET_FILE: &str = "hearth.sock";
pub const PID_FILE: &str = "hearth.pid";
pub const SERVICE_INFO_FILE: &str = "service.json";
pub const LOG_FILE: &str = "service.log";
pub const LOCAL_STORE_FILE: &str = "local.json";
pub const CHAT_STORE_FILE: &str = "chat.json";
pub const SESSION_FILE: &str = "session.json";

pub fn hearth_root(home: &Path) -> PathBuf {
    home.join(".hearth")
}

pub fn config_path(home: &Path) -> PathBuf {
    hearth_root(home).join(CONFIG_FILE)
}

pub fn run_dir(home: &Path) -> PathBuf {
    hearth_root(home).join("run")
}

pub fn data_dir(home: &Path) -> PathBuf {
    hearth_root(home).join("data")
}

pub fn logs_dir(home: &Path) -> PathBuf {
    hearth_root(home).join("logs")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(SOCKET_FILE)
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(PID_FILE)
}

pub fn service_info_path(home: &Path) -> PathBuf {
    run_dir(home).join(SERVICE_INFO_FILE)
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(LOG_FILE)
}
