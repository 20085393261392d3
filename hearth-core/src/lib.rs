//! Hearth core library: domain types, configuration, paths, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, exit codes, background task schedules
//! - [`config`]: YAML configuration with environment overrides
//! - [`paths`]: on-disk layout under `~/.hearth/`
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::ConfigError;
pub use types::{ConnectionId, ExitCode, ForkType, Schedule, Session, Uid, Username};
