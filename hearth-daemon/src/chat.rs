//! Chat pipeline modules: the outbox deliverer, the conversation loader and
//! the fetch retrier, each a per-user sub-loop.

use std::sync::{Arc, Mutex};

use hearth_core::Uid;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::guard::lock;

/// A chat sub-loop bound to the logged-in user.
pub trait ChatLoop: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start (or restart) the loop for `uid`. Starting for the uid already
    /// running is a no-op.
    fn start(&self, uid: &Uid);

    /// Ask the loop to stop. The receiver resolves once it has.
    fn stop(&self) -> oneshot::Receiver<()>;
}

struct Running {
    uid: Uid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sub-loop that idles until stopped. Stands in for loops whose work lives
/// outside the service process.
pub struct StandbyLoop {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl StandbyLoop {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }
}

impl ChatLoop for StandbyLoop {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, uid: &Uid) {
        let mut running = lock(&self.running);
        if let Some(current) = running.as_ref() {
            if current.uid == *uid {
                return;
            }
            current.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        let name = self.name;
        let handle = {
            let cancel = cancel.clone();
            let uid = uid.clone();
            tokio::spawn(async move {
                tracing::debug!(chat_loop = name, uid = %uid, "chat loop started");
                cancel.cancelled().await;
                tracing::debug!(chat_loop = name, uid = %uid, "chat loop stopped");
            })
        };
        *running = Some(Running {
            uid: uid.clone(),
            cancel,
            handle,
        });
    }

    fn stop(&self) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        match lock(&self.running).take() {
            Some(running) => {
                running.cancel.cancel();
                tokio::spawn(async move {
                    let _ = running.handle.await;
                    let _ = ack_tx.send(());
                });
            }
            None => {
                let _ = ack_tx.send(());
            }
        }
        ack_rx
    }
}

/// The chat pipeline's sub-loops, started on login and stopped on logout.
pub struct ChatModules {
    loops: Vec<Arc<dyn ChatLoop>>,
    running_for: Mutex<Option<Uid>>,
}

impl ChatModules {
    pub fn new(loops: Vec<Arc<dyn ChatLoop>>) -> Self {
        Self {
            loops,
            running_for: Mutex::new(None),
        }
    }

    /// Start every sub-loop for `uid`. Returns `false` when they were
    /// already running for that user.
    pub fn start(&self, uid: &Uid) -> bool {
        let mut running_for = lock(&self.running_for);
        if running_for.as_ref() == Some(uid) {
            return false;
        }
        for chat_loop in &self.loops {
            chat_loop.start(uid);
        }
        *running_for = Some(uid.clone());
        tracing::info!(uid = %uid, loops = self.loops.len(), "chat modules started");
        true
    }

    /// Stop every sub-loop, waiting for each acknowledgement in turn.
    pub async fn stop(&self) {
        let acks: Vec<(&'static str, oneshot::Receiver<()>)> = {
            let mut running_for = lock(&self.running_for);
            *running_for = None;
            self.loops.iter().map(|l| (l.name(), l.stop())).collect()
        };
        for (name, ack) in acks {
            if ack.await.is_err() {
                tracing::warn!(chat_loop = name, "chat loop dropped its stop acknowledgement");
            }
        }
        tracing::debug!("chat modules stopped");
    }

    pub fn running_for(&self) -> Option<Uid> {
        lock(&self.running_for).clone()
    }

    pub fn loop_names(&self) -> Vec<&'static str> {
        self.loops.iter().map(|l| l.name()).collect()
    }
}
