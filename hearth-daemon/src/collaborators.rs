//! Seams to the engines the service drives but does not implement.
//!
//! Each trait has a small local default so the service runs stand-alone;
//! deployments and tests substitute their own through [`Collaborators`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_core::{Config, Session, Uid, Username};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatLoop, StandbyLoop};
use crate::context::ServiceContext;
use crate::error::{io_err, subsystem_err, DaemonError};
use crate::push::{PushDialer, TcpDialer};

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resume the last session without network access.
    async fn login_offline(&self) -> Result<Session, DaemonError>;
    /// Log in with a device provisioned in the local secret store.
    async fn login_provisioned_device(&self) -> Result<Session, DaemonError>;
    async fn login(&self, username: &Username) -> Result<Session, DaemonError>;
    async fn logout(&self) -> Result<(), DaemonError>;
}

/// Session persisted as `session.json` in the data dir.
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Option<Session>, DaemonError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&self.path, err)),
        }
    }

    fn write(&self, session: &Session) -> Result<(), DaemonError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let json = serde_json::to_string_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

#[async_trait]
impl Authenticator for SessionFile {
    async fn login_offline(&self) -> Result<Session, DaemonError> {
        self.read()?
            .ok_or_else(|| subsystem_err("login", "no saved session"))
    }

    async fn login_provisioned_device(&self) -> Result<Session, DaemonError> {
        Err(subsystem_err("login", "no provisioned device in the secret store"))
    }

    async fn login(&self, username: &Username) -> Result<Session, DaemonError> {
        let uid = match self.read()? {
            Some(previous) if previous.username == *username => previous.uid,
            _ => Uid(uuid::Uuid::new_v4().simple().to_string()),
        };
        let session = Session::new(uid, username.clone());
        self.write(&session)?;
        Ok(session)
    }

    async fn logout(&self) -> Result<(), DaemonError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.path, err)),
        }
    }
}

// ---------------------------------------------------------------------------
// Identify
// ---------------------------------------------------------------------------

/// Cached record of a fully loaded user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullUser {
    pub uid: Uid,
    pub loaded_at: DateTime<Utc>,
}

impl FullUser {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            loaded_at: Utc::now(),
        }
    }
}

/// Users loaded by one identify run: the subject (`them`) and the caller (`me`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyOutcome {
    pub them: Option<FullUser>,
    pub me: Option<FullUser>,
}

#[async_trait]
pub trait IdentifyEngine: Send + Sync {
    async fn identify(&self, me: &Uid, target: &Uid) -> Result<(), DaemonError>;
    async fn identify_self(&self, uid: &Uid) -> Result<IdentifyOutcome, DaemonError>;
}

/// Identifies against local state only.
pub struct LocalIdentify;

#[async_trait]
impl IdentifyEngine for LocalIdentify {
    async fn identify(&self, me: &Uid, target: &Uid) -> Result<(), DaemonError> {
        tracing::debug!(me = %me, target = %target, "local identify");
        Ok(())
    }

    async fn identify_self(&self, uid: &Uid) -> Result<IdentifyOutcome, DaemonError> {
        Ok(IdentifyOutcome {
            them: Some(FullUser::new(uid.clone())),
            me: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-user keys, maintenance, rekey
// ---------------------------------------------------------------------------

#[async_trait]
pub trait KeyUpgrader: Send + Sync {
    /// Whether the current user already has a per-user key.
    async fn has_keys(&self) -> Result<bool, DaemonError>;
    async fn upgrade(&self) -> Result<(), DaemonError>;
}

/// Reports keys as present, so no upgrade is ever attempted.
pub struct NoKeyUpgrade;

#[async_trait]
impl KeyUpgrader for NoKeyUpgrade {
    async fn has_keys(&self) -> Result<bool, DaemonError> {
        Ok(true)
    }

    async fn upgrade(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

#[async_trait]
pub trait Maintenance: Send + Sync {
    async fn check_tracking(&self) -> Result<(), DaemonError>;
    /// Returns `true` when the device was revoked and the session must end.
    async fn logout_if_revoked(&self) -> Result<bool, DaemonError>;
}

pub struct NoMaintenance;

#[async_trait]
impl Maintenance for NoMaintenance {
    async fn check_tracking(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn logout_if_revoked(&self) -> Result<bool, DaemonError> {
        Ok(false)
    }
}

#[async_trait]
pub trait RekeyEngine: Send + Sync {
    /// Number of folders waiting on a rekey for `uid`.
    async fn pending(&self, uid: &Uid) -> Result<u32, DaemonError>;
}

pub struct NoRekeys;

#[async_trait]
impl RekeyEngine for NoRekeys {
    async fn pending(&self, _uid: &Uid) -> Result<u32, DaemonError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Critical subsystems
// ---------------------------------------------------------------------------

/// A subsystem installed before any client can connect. Installation
/// failure aborts startup.
pub trait CriticalSubsystem: Send + Sync {
    fn name(&self) -> &'static str;
    fn install(&self, ctx: &ServiceContext) -> Result<(), DaemonError>;
}

/// Records its installation on the context and nothing else.
pub struct Marker(pub &'static str);

impl CriticalSubsystem for Marker {
    fn name(&self) -> &'static str {
        self.0
    }

    fn install(&self, ctx: &ServiceContext) -> Result<(), DaemonError> {
        ctx.mark_installed(self.0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn Authenticator>,
    pub identify: Arc<dyn IdentifyEngine>,
    pub key_upgrader: Arc<dyn KeyUpgrader>,
    pub maintenance: Arc<dyn Maintenance>,
    pub rekey: Arc<dyn RekeyEngine>,
    pub push_dialer: Arc<dyn PushDialer>,
    pub chat_loops: Vec<Arc<dyn ChatLoop>>,
    pub critical: Vec<Arc<dyn CriticalSubsystem>>,
}

impl Collaborators {
    /// Local defaults for `config`.
    pub fn defaults(config: &Config) -> Self {
        Self {
            auth: Arc::new(SessionFile::new(config.session_path())),
            identify: Arc::new(LocalIdentify),
            key_upgrader: Arc::new(NoKeyUpgrade),
            maintenance: Arc::new(NoMaintenance),
            rekey: Arc::new(NoRekeys),
            push_dialer: Arc::new(TcpDialer::default()),
            chat_loops: vec![
                Arc::new(StandbyLoop::new("deliverer")),
                Arc::new(StandbyLoop::new("conv_loader")),
                Arc::new(StandbyLoop::new("fetch_retrier")),
            ],
            critical: vec![Arc::new(Marker("teams")), Arc::new(Marker("pvl_source"))],
        }
    }
}
