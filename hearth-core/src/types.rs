//! Domain types shared by the service and its clients.
//!
//! Identity newtypes follow one pattern: a public inner `String`, `Display`,
//! and `From<String>` / `From<&str>` conversions.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A user id. The empty string (or an all-zero id) is the nil uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Uid(pub String);

impl Uid {
    pub fn nil() -> Self {
        Self(String::new())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty() || self.0.chars().all(|c| c == '0')
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Username(pub String);

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Username {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Username {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier the notify router assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The currently logged-in identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: Uid,
    pub username: Username,
    pub logged_in_at: DateTime<Utc>,
}

impl Session {
    pub fn new(uid: impl Into<Uid>, username: impl Into<Username>) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            logged_in_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Exit code delivered through the stop signal and returned from the service run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    #[default]
    Ok,
    NotOk,
    Restart,
}

impl ExitCode {
    /// Process exit status for this code.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Ok => 0,
            ExitCode::NotOk => 2,
            ExitCode::Restart => 4,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Ok => write!(f, "ok"),
            ExitCode::NotOk => write!(f, "not_ok"),
            ExitCode::Restart => write!(f, "restart"),
        }
    }
}

/// How the service process was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForkType {
    #[default]
    None,
    Auto,
    Watchdog,
    Launchd,
}

impl fmt::Display for ForkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkType::None => write!(f, "none"),
            ForkType::Auto => write!(f, "auto"),
            ForkType::Watchdog => write!(f, "watchdog"),
            ForkType::Launchd => write!(f, "launchd"),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Cadence of a recurring background task. Immutable once the task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Delay before the first round after the task starts.
    pub start: Duration,
    /// Extra delay after each interval expiry, so that timers firing together
    /// after a suspend do not all run at once.
    pub wake_up: Duration,
    /// Delay between the end of one round and the next.
    pub interval: Duration,
    /// Time limit on each round.
    pub limit: Duration,
}

impl Schedule {
    pub const fn new(start: Duration, wake_up: Duration, interval: Duration, limit: Duration) -> Self {
        Self {
            start,
            wake_up,
            interval,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_uid_detection() {
        assert!(Uid::nil().is_nil());
        assert!(Uid::from("00000000000000000000000000000000").is_nil());
        assert!(!Uid::from("9f3a01").is_nil());
    }

    #[test]
    fn exit_codes_map_to_process_status() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::NotOk.code(), 2);
        assert_eq!(ExitCode::Restart.code(), 4);
    }

    #[test]
    fn exit_code_serializes_snake_case() {
        let json = serde_yaml::to_string(&ExitCode::NotOk).unwrap();
        assert_eq!(json.trim(), "not_ok");
    }
}
