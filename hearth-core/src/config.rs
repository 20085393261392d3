//! Service configuration.
//!
//! # Sources
//!
//! 1. Built-in defaults (paths under `~/.hearth/`, see [`crate::paths`]).
//! 2. `~/.hearth/config.yaml`, every key optional.
//! 3. `HEARTH_*` environment overrides, applied last.
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

pub const DEFAULT_PUSH_URI: &str = "fmp://127.0.0.1:9911";

pub const ENV_PUSH_URI: &str = "HEARTH_PUSH_URI";
pub const ENV_PUSH_DISABLED: &str = "HEARTH_PUSH_DISABLED";
pub const ENV_BG_IDENTIFIER_DISABLED: &str = "HEARTH_BG_IDENTIFIER_DISABLED";
pub const ENV_UPGRADE_PER_USER_KEY: &str = "HEARTH_UPGRADE_PER_USER_KEY";
pub const ENV_RUN_DIR: &str = "HEARTH_RUN_DIR";
pub const ENV_SOCKET_FILE: &str = "HEARTH_SOCKET_FILE";

/// Resolved service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Home directory all default paths are derived from. Not read from YAML.
    #[serde(skip)]
    pub home: PathBuf,
    pub run_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub socket_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub service_info_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub push_uri: String,
    pub push_disabled: bool,
    pub bg_identifier_disabled: bool,
    pub upgrade_per_user_key: bool,
    pub label: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::new(),
            run_dir: None,
            data_dir: None,
            socket_file: None,
            pid_file: None,
            service_info_file: None,
            log_file: None,
            push_uri: DEFAULT_PUSH_URI.to_string(),
            push_disabled: false,
            bg_identifier_disabled: false,
            upgrade_per_user_key: true,
            label: None,
        }
    }
}

impl Config {
    /// Defaults rooted at `home`.
    pub fn defaults_at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.run_dir
            .clone()
            .unwrap_or_else(|| paths::run_dir(&self.home))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| paths::data_dir(&self.home))
    }

    /// Socket path. A configured run dir moves the default socket with it.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_file
            .clone()
            .unwrap_or_else(|| self.run_dir().join(paths::SOCKET_FILE))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.run_dir().join(paths::PID_FILE))
    }

    pub fn service_info_path(&self) -> PathBuf {
        self.service_info_file
            .clone()
            .unwrap_or_else(|| self.run_dir().join(paths::SERVICE_INFO_FILE))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| paths::log_path(&self.home))
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir().join(paths::LOCAL_STORE_FILE)
    }

    pub fn chat_store_path(&self) -> PathBuf {
        self.data_dir().join(paths::CHAT_STORE_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir().join(paths::SESSION_FILE)
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(paths::SERVICE_LABEL)
    }

    /// Apply `HEARTH_*` overrides read through `lookup`.
    ///
    /// Taking the lookup as a closure keeps tests independent of the process
    /// environment.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup(ENV_PUSH_URI) {
            self.push_uri = uri;
        }
        if let Some(value) = lookup(ENV_PUSH_DISABLED) {
            self.push_disabled = parse_bool(ENV_PUSH_DISABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_BG_IDENTIFIER_DISABLED) {
            self.bg_identifier_disabled = parse_bool(ENV_BG_IDENTIFIER_DISABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_UPGRADE_PER_USER_KEY) {
            self.upgrade_per_user_key = parse_bool(ENV_UPGRADE_PER_USER_KEY, &value)?;
        }
        if let Some(dir) = lookup(ENV_RUN_DIR) {
            self.run_dir = Some(PathBuf::from(dir));
        }
        if let Some(socket) = lookup(ENV_SOCKET_FILE) {
            self.socket_file = Some(PathBuf::from(socket));
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }
}

/// Load `<home>/.hearth/config.yaml`, falling back to defaults when absent.
///
/// Environment overrides are not applied; see [`resolve_at`].
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = paths::config_path(home);
    if !path.exists() {
        return Ok(Config::defaults_at(home));
    }
    let contents = std::fs::read_to_string(&path)?;
    // An empty file deserializes to `null`, which is not a mapping.
    if contents.trim().is_empty() {
        return Ok(Config::defaults_at(home));
    }
    let mut config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.home = home.to_path_buf();
    Ok(config)
}

/// [`load_at`] followed by environment overrides.
pub fn resolve_at(home: &Path) -> Result<Config, ConfigError> {
    let mut config = load_at(home)?;
    config.apply_env()?;
    Ok(config)
}

/// `resolve_at` convenience wrapper.
pub fn resolve() -> Result<Config, ConfigError> {
    resolve_at(&home()?)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}
