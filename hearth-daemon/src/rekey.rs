//! Rekey master: tracks folders waiting on a rekey for the logged-in user
//! and reflects the count in the badge state.
//!
//! Checks run on login, on `rekey.check_now`, and whenever the push server
//! sends the `kbfs.rekey` out-of-band message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hearth_core::{ConnectionId, Uid};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::badger::Badger;
use crate::collaborators::RekeyEngine;
use crate::guard::lock;
use crate::push::PushHandler;

pub const REKEY_OOB_SYSTEM: &str = "kbfs.rekey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RekeyStatus {
    pub uid: Option<Uid>,
    pub pending: u32,
    pub ui_connection: Option<ConnectionId>,
    pub checks: u64,
}

#[derive(Default)]
struct RekeyState {
    uid: Option<Uid>,
    pending: u32,
    ui: Option<ConnectionId>,
    checks: u64,
}

pub struct RekeyMaster {
    engine: Arc<dyn RekeyEngine>,
    badger: Arc<Badger>,
    state: Mutex<RekeyState>,
    wake: Notify,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl RekeyMaster {
    pub fn new(engine: Arc<dyn RekeyEngine>, badger: Arc<Badger>) -> Self {
        Self {
            engine,
            badger,
            state: Mutex::new(RekeyState::default()),
            wake: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the check loop. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let master = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = master.shutdown.cancelled() => break,
                    _ = master.wake.notified() => master.check().await,
                }
            }
            tracing::debug!("rekey master stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn login(&self, uid: &Uid) {
        lock(&self.state).uid = Some(uid.clone());
        self.wake.notify_one();
    }

    pub fn logout(&self) {
        {
            let mut state = lock(&self.state);
            state.uid = None;
            state.pending = 0;
        }
        self.badger.set_rekeys_needed(0);
    }

    pub fn check_now(&self) {
        self.wake.notify_one();
    }

    /// Claim the rekey UI for `conn`. The most recent registration wins.
    pub fn register_ui(&self, conn: ConnectionId) {
        lock(&self.state).ui = Some(conn);
    }

    /// Release the rekey UI if `conn` still holds it.
    pub fn unregister_ui(&self, conn: ConnectionId) -> bool {
        let mut state = lock(&self.state);
        if state.ui == Some(conn) {
            state.ui = None;
            true
        } else {
            false
        }
    }

    pub fn status(&self) -> RekeyStatus {
        let state = lock(&self.state);
        RekeyStatus {
            uid: state.uid.clone(),
            pending: state.pending,
            ui_connection: state.ui,
            checks: state.checks,
        }
    }

    async fn check(&self) {
        let Some(uid) = lock(&self.state).uid.clone() else {
            tracing::debug!("rekey check skipped; logged out");
            return;
        };
        match self.engine.pending(&uid).await {
            Ok(pending) => {
                {
                    let mut state = lock(&self.state);
                    if state.uid.as_ref() != Some(&uid) {
                        return;
                    }
                    state.pending = pending;
                    state.checks += 1;
                }
                self.badger.set_rekeys_needed(pending);
                tracing::debug!(uid = %uid, pending, "rekey check complete");
            }
            Err(err) => tracing::warn!(uid = %uid, error = %err, "rekey check failed"),
        }
    }
}

impl PushHandler for RekeyMaster {
    fn name(&self) -> &'static str {
        "rekey_master"
    }

    fn on_out_of_band(&self, system: &str, _body: &str) {
        if system == REKEY_OOB_SYSTEM {
            self.check_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use crate::router::NotifyRouter;
    use async_trait::async_trait;

    struct Fixed(u32);

    #[async_trait]
    impl RekeyEngine for Fixed {
        async fn pending(&self, _uid: &Uid) -> Result<u32, DaemonError> {
            Ok(self.0)
        }
    }

    async fn settle(master: &RekeyMaster, checks: u64) {
        for _ in 0..50 {
            if master.status().checks >= checks {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn login_check_updates_badges_and_logout_clears_them() {
        let badger = Arc::new(Badger::new(Arc::new(NotifyRouter::new())));
        let master = Arc::new(RekeyMaster::new(Arc::new(Fixed(3)), Arc::clone(&badger)));
        master.start();

        master.login(&Uid::from("9f3a01"));
        settle(&master, 1).await;
        assert_eq!(master.status().pending, 3);
        assert_eq!(badger.state().rekeys_needed, 3);

        master.on_out_of_band(REKEY_OOB_SYSTEM, "");
        settle(&master, 2).await;
        assert_eq!(master.status().checks, 2);

        master.logout();
        assert_eq!(badger.state().rekeys_needed, 0);
        master.shutdown();
    }

    #[test]
    fn only_the_owner_releases_the_ui() {
        let badger = Arc::new(Badger::new(Arc::new(NotifyRouter::new())));
        let master = RekeyMaster::new(Arc::new(Fixed(0)), badger);
        master.register_ui(ConnectionId(1));
        master.register_ui(ConnectionId(2));
        assert!(!master.unregister_ui(ConnectionId(1)));
        assert!(master.unregister_ui(ConnectionId(2)));
        assert_eq!(master.status().ui_connection, None);
    }
}
