//! Process-wide service context shared by every connection and subsystem.

use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use chrono::{DateTime, Utc};
use hearth_core::{Config, ExitCode, ForkType, Session, Uid};
use tokio::sync::oneshot;

use crate::collaborators::{Collaborators, FullUser};
use crate::error::DaemonError;
use crate::guard::{lock, read, write};
use crate::hooks::{LoginHook, ShutdownHooks, UserChangedHandler};
use crate::router::NotifyRouter;
use crate::store::LocalStore;

/// The two local databases opened at startup.
pub struct Stores {
    pub local: LocalStore,
    pub chat: LocalStore,
}

pub struct ServiceContext {
    pub config: Config,
    pub router: Arc<NotifyRouter>,
    pub shutdown_hooks: ShutdownHooks,
    pub collaborators: Collaborators,
    pub started_at: DateTime<Utc>,
    pub fork_type: ForkType,
    session: RwLock<Option<Session>>,
    full_self: RwLock<Option<FullUser>>,
    login_hooks: Mutex<Vec<Weak<dyn LoginHook>>>,
    user_changed: Mutex<Vec<Weak<dyn UserChangedHandler>>>,
    stores: OnceLock<Stores>,
    installed: Mutex<Vec<&'static str>>,
    stop: Mutex<Option<oneshot::Sender<ExitCode>>>,
}

impl ServiceContext {
    /// Build a context and the receiving end of its stop signal.
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        fork_type: ForkType,
    ) -> (Self, oneshot::Receiver<ExitCode>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let ctx = Self {
            config,
            router: Arc::new(NotifyRouter::new()),
            shutdown_hooks: ShutdownHooks::new(),
            collaborators,
            started_at: Utc::now(),
            fork_type,
            session: RwLock::new(None),
            full_self: RwLock::new(None),
            login_hooks: Mutex::new(Vec::new()),
            user_changed: Mutex::new(Vec::new()),
            stores: OnceLock::new(),
            installed: Mutex::new(Vec::new()),
            stop: Mutex::new(Some(stop_tx)),
        };
        (ctx, stop_rx)
    }

    // -- session ------------------------------------------------------------

    pub fn session(&self) -> Option<Session> {
        read(&self.session).clone()
    }

    pub fn uid(&self) -> Option<Uid> {
        read(&self.session).as_ref().map(|s| s.uid.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        read(&self.session).is_some()
    }

    /// Adopt a session found at startup, unless a client already logged in.
    pub fn restore_session(&self, session: Session) -> bool {
        let mut current = write(&self.session);
        if current.is_some() {
            return false;
        }
        *current = Some(session);
        true
    }

    /// Record a login and tell every observer.
    pub async fn login(&self, session: Session) {
        *write(&self.session) = Some(session.clone());
        self.router.handle_login(&session.username);
        for hook in self.live_login_hooks() {
            if let Err(err) = hook.on_login(&session).await {
                tracing::warn!(error = %err, "login hook failed");
            }
        }
    }

    /// Clear the session and tell every observer.
    pub async fn logout(&self) {
        *write(&self.session) = None;
        *write(&self.full_self) = None;
        self.router.handle_logout();
        for hook in self.live_login_hooks() {
            if let Err(err) = hook.on_logout().await {
                tracing::warn!(error = %err, "logout hook failed");
            }
        }
    }

    // -- observers ----------------------------------------------------------

    /// Register a login observer. Held weakly; a dropped observer is skipped.
    pub fn add_login_hook(&self, hook: Weak<dyn LoginHook>) {
        lock(&self.login_hooks).push(hook);
    }

    pub fn clear_login_hooks(&self) {
        lock(&self.login_hooks).clear();
    }

    fn live_login_hooks(&self) -> Vec<Arc<dyn LoginHook>> {
        let mut hooks = lock(&self.login_hooks);
        hooks.retain(|h| h.strong_count() > 0);
        hooks.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn add_user_changed_handler(&self, handler: Weak<dyn UserChangedHandler>) {
        lock(&self.user_changed).push(handler);
    }

    pub fn notify_user_changed(&self, uid: &Uid) {
        let handlers: Vec<Arc<dyn UserChangedHandler>> = {
            let mut handlers = lock(&self.user_changed);
            handlers.retain(|h| h.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(uid = %uid, handlers = handlers.len(), "user changed");
        for handler in handlers {
            handler.handle_user_changed(uid);
        }
    }

    // -- self identify cache ------------------------------------------------

    pub fn full_self(&self) -> Option<FullUser> {
        read(&self.full_self).clone()
    }

    pub fn set_full_self(&self, user: FullUser) {
        *write(&self.full_self) = Some(user);
    }

    // -- stores ---------------------------------------------------------------

    pub fn install_stores(&self, stores: Stores) -> Result<(), DaemonError> {
        self.stores
            .set(stores)
            .map_err(|_| DaemonError::Protocol("local stores already open".to_string()))
    }

    pub fn stores(&self) -> Option<&Stores> {
        self.stores.get()
    }

    // -- critical subsystems ------------------------------------------------

    pub fn mark_installed(&self, name: &'static str) {
        lock(&self.installed).push(name);
    }

    pub fn installed(&self) -> Vec<&'static str> {
        lock(&self.installed).clone()
    }

    // -- stop -----------------------------------------------------------------

    /// Deliver the exit code to the running service. Only the first request
    /// is accepted.
    pub fn request_stop(&self, code: ExitCode) -> bool {
        match lock(&self.stop).take() {
            Some(stop) => {
                tracing::info!(exit_code = %code, "stop requested");
                stop.send(code).is_ok()
            }
            None => {
                tracing::debug!(exit_code = %code, "stop already requested");
                false
            }
        }
    }
}
