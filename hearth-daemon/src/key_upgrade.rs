//! Background per-user-key upgrade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::Schedule;

use crate::background::{BackgroundTask, RoundContext, RoundWork, TaskProbes};
use crate::collaborators::KeyUpgrader;
use crate::error::DaemonError;
use crate::push::{Connectivity, Reachability};

pub const PER_USER_KEY_SCHEDULE: Schedule = Schedule::new(
    Duration::from_secs(30),
    Duration::from_secs(10),
    Duration::from_secs(60 * 60),
    Duration::from_secs(5 * 60),
);

struct UpgradeRound {
    reachability: Arc<Reachability>,
    upgrader: Arc<dyn KeyUpgrader>,
}

#[async_trait]
impl RoundWork for UpgradeRound {
    async fn run_round(&self, ctx: RoundContext) -> Result<(), DaemonError> {
        if self.reachability.current() == Connectivity::No {
            tracing::debug!("per-user-key upgrade skipped; offline");
            return Ok(());
        }
        match self.upgrader.has_keys().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(error = %err, "could not check for per-user keys; attempting upgrade");
            }
        }
        if ctx.deadline.is_cancelled() {
            return Ok(());
        }
        tracing::info!(round = ctx.round, "upgrading to per-user keys");
        self.upgrader.upgrade().await
    }
}

/// Owns the upgrade task. The task exists from construction so that
/// [`Self::shutdown`] is safe before [`Self::run`]. Only built when
/// `upgrade_per_user_key` is set.
pub struct PerUserKeyBackground {
    task: Arc<BackgroundTask>,
}

impl PerUserKeyBackground {
    pub fn new(
        reachability: Arc<Reachability>,
        upgrader: Arc<dyn KeyUpgrader>,
    ) -> Self {
        Self::with_schedule(reachability, upgrader, PER_USER_KEY_SCHEDULE, TaskProbes::default())
    }

    pub fn with_schedule(
        reachability: Arc<Reachability>,
        upgrader: Arc<dyn KeyUpgrader>,
        schedule: Schedule,
        probes: TaskProbes,
    ) -> Self {
        let work = Arc::new(UpgradeRound {
            reachability,
            upgrader,
        });
        Self {
            task: BackgroundTask::with_probes("per_user_key_upgrade", schedule, work, probes),
        }
    }

    pub fn run(&self) -> bool {
        self.task.run()
    }

    pub fn shutdown(&self) {
        self.task.shutdown();
    }

    pub fn wake(&self) {
        self.task.wake();
    }

    pub fn task(&self) -> &Arc<BackgroundTask> {
        &self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Fake {
        has_keys: AtomicBool,
        upgrades: AtomicUsize,
    }

    #[async_trait]
    impl KeyUpgrader for Fake {
        async fn has_keys(&self) -> Result<bool, DaemonError> {
            Ok(self.has_keys.load(Ordering::SeqCst))
        }

        async fn upgrade(&self) -> Result<(), DaemonError> {
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            self.has_keys.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fake() -> Arc<Fake> {
        Arc::new(Fake {
            has_keys: AtomicBool::new(false),
            upgrades: AtomicUsize::new(0),
        })
    }

    fn round_probes() -> (TaskProbes, mpsc::UnboundedReceiver<Result<(), crate::background::RoundError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskProbes {
                meta: None,
                rounds: Some(tx),
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn upgrades_once_then_finds_keys() {
        let upgrader = fake();
        let (probes, mut rounds) = round_probes();
        let bg = PerUserKeyBackground::with_schedule(
            Arc::new(Reachability::new()),
            upgrader.clone(),
            PER_USER_KEY_SCHEDULE,
            probes,
        );
        bg.run();
        rounds.recv().await.unwrap().unwrap();
        bg.wake();
        rounds.recv().await.unwrap().unwrap();
        assert_eq!(upgrader.upgrades.load(Ordering::SeqCst), 1);
        bg.shutdown();
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn offline_rounds_do_nothing() {
        let upgrader = fake();
        let reachability = Arc::new(Reachability::new());
        reachability.set(Connectivity::No);
        let (probes, mut rounds) = round_probes();
        let offline = PerUserKeyBackground::with_schedule(
            reachability,
            upgrader.clone(),
            PER_USER_KEY_SCHEDULE,
            probes,
        );
        offline.run();
        rounds.recv().await.unwrap().unwrap();
        offline.wake();
        rounds.recv().await.unwrap().unwrap();
        offline.shutdown();

        assert_eq!(upgrader.upgrades.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_before_run_is_safe() {
        let bg = PerUserKeyBackground::new(Arc::new(Reachability::new()), fake());
        bg.shutdown();
        assert!(!bg.run());
        bg.task().wait_stopped().await;
    }
}
