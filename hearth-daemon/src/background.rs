//! Recurring background work on a fixed schedule.
//!
//! A [`BackgroundTask`] waits `start`, then repeats: run one round under the
//! `limit`, wait `interval`, wait `wake_up`. A manual [`BackgroundTask::wake`]
//! cuts the current wait short; wakes that arrive while a round is running
//! coalesce into a single extra round.
//!
//! A round that overruns its limit is reported as [`RoundError::TimedOut`]
//! and its [`RoundContext::deadline`] token is cancelled. The round itself is
//! never aborted; the loop moves on without it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::Schedule;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DaemonError;

/// Passed to every round.
#[derive(Debug, Clone)]
pub struct RoundContext {
    /// 1-based round counter.
    pub round: u64,
    /// Cancelled when the round exceeds its time limit.
    pub deadline: CancellationToken,
}

/// The unit of work a task repeats.
#[async_trait]
pub trait RoundWork: Send + Sync + 'static {
    async fn run_round(&self, ctx: RoundContext) -> Result<(), DaemonError>;
}

/// Adapter for closures returning a future.
pub struct FnRound<F>(pub F);

#[async_trait]
impl<F, Fut> RoundWork for FnRound<F>
where
    F: Fn(RoundContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    async fn run_round(&self, ctx: RoundContext) -> Result<(), DaemonError> {
        (self.0)(ctx).await
    }
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round exceeded its {0:?} limit")]
    TimedOut(Duration),

    #[error("round failed: {0}")]
    Failed(#[source] DaemonError),

    #[error("round panicked: {0}")]
    Panicked(String),
}

/// Optional observers used by tests and diagnostics.
///
/// `meta` receives loop markers (`loop-start`, `woke-start`, `round-start`,
/// `round-complete`, `woke-interval`, `woke-wakeup`, `woke-manual`,
/// `loop-exit`); `rounds` receives every round outcome.
#[derive(Debug, Clone, Default)]
pub struct TaskProbes {
    pub meta: Option<mpsc::UnboundedSender<&'static str>>,
    pub rounds: Option<mpsc::UnboundedSender<Result<(), RoundError>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Running,
    Stopped,
}

enum Wake {
    Elapsed,
    Manual,
    Shutdown,
}

pub struct BackgroundTask {
    name: &'static str,
    schedule: Schedule,
    work: Arc<dyn RoundWork>,
    shutdown: CancellationToken,
    wake: Notify,
    phase: watch::Sender<TaskPhase>,
    probes: TaskProbes,
}

impl BackgroundTask {
    pub fn new(name: &'static str, schedule: Schedule, work: Arc<dyn RoundWork>) -> Arc<Self> {
        Self::with_probes(name, schedule, work, TaskProbes::default())
    }

    pub fn with_probes(
        name: &'static str,
        schedule: Schedule,
        work: Arc<dyn RoundWork>,
        probes: TaskProbes,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(TaskPhase::Idle);
        Arc::new(Self {
            name,
            schedule,
            work,
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
            phase,
            probes,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn phase(&self) -> TaskPhase {
        *self.phase.borrow()
    }

    /// Start the loop. Returns immediately; `false` when the task was already
    /// started or has been shut down.
    pub fn run(self: &Arc<Self>) -> bool {
        let mut claimed = false;
        self.phase.send_if_modified(|phase| {
            if *phase == TaskPhase::Idle {
                *phase = TaskPhase::Running;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            tracing::debug!(task = self.name, "run ignored; task already started or stopped");
            return false;
        }

        let task = Arc::clone(self);
        tokio::spawn(async move {
            task.run_loop().await;
            task.phase.send_replace(TaskPhase::Stopped);
            task.meta("loop-exit");
            tracing::debug!(task = task.name, "background task exited");
        });
        true
    }

    /// Stop scheduling rounds. Idempotent and safe before [`Self::run`]; a
    /// round already in progress is allowed to finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.phase.send_if_modified(|phase| {
            if *phase == TaskPhase::Idle {
                *phase = TaskPhase::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Run a round as soon as possible.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the loop has exited (or the task was stopped unstarted).
    pub async fn wait_stopped(&self) {
        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p == TaskPhase::Stopped).await;
    }

    async fn run_loop(&self) {
        self.meta("loop-start");
        match self.pause(self.schedule.start).await {
            Wake::Shutdown => return,
            Wake::Elapsed | Wake::Manual => self.meta("woke-start"),
        }

        let mut round = 0u64;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            round += 1;
            self.run_round(round).await;
            self.meta("round-complete");

            match self.pause(self.schedule.interval).await {
                Wake::Shutdown => return,
                Wake::Manual => {
                    self.meta("woke-manual");
                    continue;
                }
                Wake::Elapsed => self.meta("woke-interval"),
            }
            match self.pause(self.schedule.wake_up).await {
                Wake::Shutdown => return,
                Wake::Manual => self.meta("woke-manual"),
                Wake::Elapsed => self.meta("woke-wakeup"),
            }
        }
    }

    async fn run_round(&self, round: u64) {
        self.meta("round-start");
        let deadline = CancellationToken::new();
        let ctx = RoundContext {
            round,
            deadline: deadline.clone(),
        };
        let work = Arc::clone(&self.work);
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { work.run_round(ctx).await });

        let joined = if self.schedule.limit.is_zero() {
            Some((&mut handle).await)
        } else {
            tokio::time::timeout(self.schedule.limit, &mut handle).await.ok()
        };
        let outcome = match joined {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(err))) => Err(RoundError::Failed(err)),
            Some(Err(join_err)) => Err(RoundError::Panicked(join_err.to_string())),
            None => {
                deadline.cancel();
                Err(RoundError::TimedOut(self.schedule.limit))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => tracing::debug!(task = self.name, round, elapsed_ms, "round complete"),
            Err(err) => tracing::warn!(task = self.name, round, elapsed_ms, error = %err, "round failed"),
        }
        if let Some(rounds) = &self.probes.rounds {
            let _ = rounds.send(outcome);
        }
    }

    async fn pause(&self, delay: Duration) -> Wake {
        if self.shutdown.is_cancelled() {
            return Wake::Shutdown;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            _ = self.wake.notified() => Wake::Manual,
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
        }
    }

    fn meta(&self, marker: &'static str) {
        if let Some(meta) = &self.probes.meta {
            let _ = meta.send(marker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::subsystem_err;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schedule(start_ms: u64, interval_ms: u64, limit_ms: u64) -> Schedule {
        Schedule::new(
            Duration::from_millis(start_ms),
            Duration::ZERO,
            Duration::from_millis(interval_ms),
            Duration::from_millis(limit_ms),
        )
    }

    fn counting_work(counter: Arc<AtomicUsize>) -> Arc<dyn RoundWork> {
        Arc::new(FnRound(move |_ctx: RoundContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_before_start_delay_never_runs_a_round() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::new("t", schedule(10_000, 1_000, 1_000), counting_work(counter.clone()));
        assert!(task.run());
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        task.shutdown();
        task.wait_stopped().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(task.phase(), TaskPhase::Stopped);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_before_run_stops_without_starting() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::new("t", schedule(0, 1_000, 1_000), counting_work(counter.clone()));
        task.shutdown();
        assert_eq!(task.phase(), TaskPhase::Stopped);
        assert!(!task.run());
        task.wait_stopped().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn concurrent_shutdowns_exit_the_loop_once() {
        let (meta_tx, mut meta_rx) = mpsc::unbounded_channel();
        let probes = TaskProbes {
            meta: Some(meta_tx),
            rounds: None,
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::with_probes("t", schedule(0, 1_000, 1_000), counting_work(counter), probes);
        assert!(task.run());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let task = Arc::clone(&task);
                tokio::spawn(async move { task.shutdown() })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }
        task.wait_stopped().await;
        task.shutdown();
        drop(task);

        let mut exits = 0;
        while let Some(marker) = meta_rx.recv().await {
            if marker == "loop-exit" {
                exits += 1;
            }
        }
        assert_eq!(exits, 1);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn wakes_during_a_round_coalesce_into_one_extra_round() {
        let (rounds_tx, mut rounds_rx) = mpsc::unbounded_channel();
        let probes = TaskProbes {
            meta: None,
            rounds: Some(rounds_tx),
        };
        let work: Arc<dyn RoundWork> = Arc::new(FnRound(|ctx: RoundContext| async move {
            if ctx.round == 1 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(())
        }));
        let task = BackgroundTask::with_probes("t", schedule(0, 3_600_000, 60_000), work, probes);
        let origin = Instant::now();
        task.run();

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.wake();
        task.wake();
        task.wake();

        rounds_rx.recv().await.unwrap().unwrap();
        rounds_rx.recv().await.unwrap().unwrap();
        assert!(origin.elapsed() < Duration::from_secs(2), "extra round should follow immediately");

        let third = tokio::time::timeout(Duration::from_secs(1_800), rounds_rx.recv()).await;
        assert!(third.is_err(), "no further round before the interval");
        task.shutdown();
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn overlong_round_times_out_and_loop_continues() {
        let (rounds_tx, mut rounds_rx) = mpsc::unbounded_channel();
        let probes = TaskProbes {
            meta: None,
            rounds: Some(rounds_tx),
        };
        let deadline_seen = Arc::new(AtomicUsize::new(0));
        let work: Arc<dyn RoundWork> = {
            let deadline_seen = Arc::clone(&deadline_seen);
            Arc::new(FnRound(move |ctx: RoundContext| {
                let deadline_seen = Arc::clone(&deadline_seen);
                async move {
                    if ctx.round == 1 {
                        tokio::select! {
                            _ = ctx.deadline.cancelled() => { deadline_seen.fetch_add(1, Ordering::SeqCst); }
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        }
                    }
                    Ok(())
                }
            }))
        };
        let task = BackgroundTask::with_probes("t", schedule(0, 100, 50), work, probes);
        let origin = Instant::now();
        task.run();

        let first = rounds_rx.recv().await.unwrap();
        assert!(matches!(first, Err(RoundError::TimedOut(limit)) if limit == Duration::from_millis(50)));
        let first_at = origin.elapsed();
        assert!(first_at >= Duration::from_millis(50) && first_at < Duration::from_millis(100));

        rounds_rx.recv().await.unwrap().unwrap();
        let second_at = origin.elapsed();
        assert!(second_at >= Duration::from_millis(150) && second_at < Duration::from_millis(200));
        assert_eq!(deadline_seen.load(Ordering::SeqCst), 1);
        task.shutdown();
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn failed_rounds_do_not_stop_the_loop() {
        let (rounds_tx, mut rounds_rx) = mpsc::unbounded_channel();
        let probes = TaskProbes {
            meta: None,
            rounds: Some(rounds_tx),
        };
        let work: Arc<dyn RoundWork> =
            Arc::new(FnRound(|_ctx: RoundContext| async { Err(subsystem_err("test", "boom")) }));
        let task = BackgroundTask::with_probes("t", schedule(0, 10, 10), work, probes);
        task.run();
        for _ in 0..3 {
            let outcome = rounds_rx.recv().await.unwrap();
            assert!(matches!(outcome, Err(RoundError::Failed(_))));
        }
        task.shutdown();
        task.wait_stopped().await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_mid_round_lets_the_round_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let work: Arc<dyn RoundWork> = {
            let finished = Arc::clone(&finished);
            Arc::new(FnRound(move |_ctx: RoundContext| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
        };
        let task = BackgroundTask::new("t", schedule(0, 10, 10_000), work);
        task.run();
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.shutdown();
        task.wait_stopped().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
