//! Background identifier: re-identifies users whose sigchains changed,
//! on behalf of the logged-in user.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::{Schedule, Uid};

use crate::background::{BackgroundTask, RoundContext, RoundWork};
use crate::collaborators::IdentifyEngine;
use crate::error::{subsystem_err, DaemonError};
use crate::guard::lock;
use crate::hooks::UserChangedHandler;

pub const BG_IDENTIFIER_SCHEDULE: Schedule = Schedule::new(
    Duration::ZERO,
    Duration::ZERO,
    Duration::from_secs(10),
    Duration::from_secs(60),
);

/// Identifies per round.
const BATCH: usize = 16;

pub struct BackgroundIdentifier {
    uid: Uid,
    task: Arc<BackgroundTask>,
    queue: Arc<Mutex<BTreeSet<Uid>>>,
    logged_out: AtomicBool,
}

struct IdentifyRound {
    me: Uid,
    engine: Arc<dyn IdentifyEngine>,
    queue: Arc<Mutex<BTreeSet<Uid>>>,
}

#[async_trait]
impl RoundWork for IdentifyRound {
    async fn run_round(&self, ctx: RoundContext) -> Result<(), DaemonError> {
        let batch: Vec<Uid> = {
            let mut queue = lock(&self.queue);
            let batch: Vec<Uid> = queue.iter().take(BATCH).cloned().collect();
            for uid in &batch {
                queue.remove(uid);
            }
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut failed = 0usize;
        for (done, target) in batch.iter().enumerate() {
            if ctx.deadline.is_cancelled() {
                // Out of time: put the rest back for the next round.
                lock(&self.queue).extend(batch[done..].iter().cloned());
                break;
            }
            if let Err(err) = self.engine.identify(&self.me, target).await {
                tracing::debug!(target = %target, error = %err, "background identify failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(subsystem_err(
                "background_identifier",
                format!("{failed} of {} identifies failed", batch.len()),
            ));
        }
        Ok(())
    }
}

impl BackgroundIdentifier {
    /// Create and start an identifier for `uid`.
    pub fn start(uid: Uid, engine: Arc<dyn IdentifyEngine>, schedule: Schedule) -> Arc<Self> {
        let queue = Arc::new(Mutex::new(BTreeSet::new()));
        let work = Arc::new(IdentifyRound {
            me: uid.clone(),
            engine,
            queue: Arc::clone(&queue),
        });
        let task = BackgroundTask::new("background_identifier", schedule, work);
        task.run();
        tracing::info!(uid = %uid, "background identifier started");
        Arc::new(Self {
            uid,
            task,
            queue,
            logged_out: AtomicBool::new(false),
        })
    }

    /// Reuse `existing` when it already serves `uid`; otherwise stop it and
    /// start a new identifier. `Ok(None)` means no replacement was needed.
    pub fn start_or_reuse(
        existing: Option<&Arc<Self>>,
        uid: &Uid,
        engine: Arc<dyn IdentifyEngine>,
        schedule: Schedule,
    ) -> Result<Option<Arc<Self>>, DaemonError> {
        if uid.is_nil() {
            return Err(subsystem_err("background_identifier", "cannot start for nil uid"));
        }
        if let Some(current) = existing {
            if current.uid == *uid && !current.is_logged_out() {
                return Ok(None);
            }
            current.logout();
        }
        Ok(Some(Self::start(uid.clone(), engine, schedule)))
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Stop identifying. The identifier cannot be restarted.
    pub fn logout(&self) {
        if !self.logged_out.swap(true, Ordering::SeqCst) {
            self.task.shutdown();
            tracing::info!(uid = %self.uid, "background identifier stopped");
        }
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn task(&self) -> &Arc<BackgroundTask> {
        &self.task
    }
}

impl UserChangedHandler for BackgroundIdentifier {
    fn handle_user_changed(&self, uid: &Uid) {
        if self.is_logged_out() || *uid == self.uid {
            return;
        }
        lock(&self.queue).insert(uid.clone());
        self.task.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::IdentifyOutcome;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        identified: AtomicUsize,
    }

    #[async_trait]
    impl IdentifyEngine for Counting {
        async fn identify(&self, _me: &Uid, _target: &Uid) -> Result<(), DaemonError> {
            self.identified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn identify_self(&self, _uid: &Uid) -> Result<IdentifyOutcome, DaemonError> {
            Ok(IdentifyOutcome::default())
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn reuses_identifier_for_same_user() {
        let engine = Arc::new(Counting::default());
        let uid = Uid::from("9f3a01");
        let first = BackgroundIdentifier::start_or_reuse(None, &uid, engine.clone(), BG_IDENTIFIER_SCHEDULE)
            .unwrap()
            .unwrap();
        let again =
            BackgroundIdentifier::start_or_reuse(Some(&first), &uid, engine.clone(), BG_IDENTIFIER_SCHEDULE).unwrap();
        assert!(again.is_none());

        let other = Uid::from("77aa02");
        let replaced =
            BackgroundIdentifier::start_or_reuse(Some(&first), &other, engine.clone(), BG_IDENTIFIER_SCHEDULE)
                .unwrap()
                .unwrap();
        assert!(first.is_logged_out());
        assert_eq!(replaced.uid(), &other);

        assert!(BackgroundIdentifier::start_or_reuse(None, &Uid::nil(), engine, BG_IDENTIFIER_SCHEDULE).is_err());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn changed_users_are_identified_on_wake() {
        let engine = Arc::new(Counting::default());
        let identifier =
            BackgroundIdentifier::start(Uid::from("9f3a01"), engine.clone(), BG_IDENTIFIER_SCHEDULE);
        tokio::time::sleep(Duration::from_millis(10)).await;

        identifier.handle_user_changed(&Uid::from("aa01"));
        identifier.handle_user_changed(&Uid::from("bb02"));
        identifier.handle_user_changed(&Uid::from("9f3a01"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.identified.load(Ordering::SeqCst), 2);
        assert_eq!(identifier.queued(), 0);

        identifier.logout();
        identifier.task().wait_stopped().await;
    }
}
