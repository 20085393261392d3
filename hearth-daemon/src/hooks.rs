//! Shutdown hooks and login/logout observers.

use std::sync::Mutex;

use async_trait::async_trait;
use hearth_core::{Session, Uid};

use crate::error::DaemonError;
use crate::guard::lock;

type HookFn = Box<dyn FnOnce() -> Result<(), DaemonError> + Send>;

/// Handle returned by [`ShutdownHooks::push`], used to withdraw a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Ordered list of actions run once when the service shuts down.
///
/// Hooks run in the order they were pushed. A hook pushed after
/// [`ShutdownHooks::run_all`] has started runs immediately.
#[derive(Default)]
pub struct ShutdownHooks {
    inner: Mutex<HooksInner>,
}

#[derive(Default)]
struct HooksInner {
    next_id: u64,
    hooks: Vec<(HookId, &'static str, HookFn)>,
    ran: bool,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, name: &'static str, hook: F) -> HookId
    where
        F: FnOnce() -> Result<(), DaemonError> + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = HookId(inner.next_id);
        if inner.ran {
            drop(inner);
            run_hook(name, Box::new(hook));
        } else {
            inner.hooks.push((id, name, Box::new(hook)));
        }
        id
    }

    /// Withdraw a hook that has not run yet. Returns whether it was found.
    pub fn remove(&self, id: HookId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.hooks.len();
        inner.hooks.retain(|(hook_id, _, _)| *hook_id != id);
        inner.hooks.len() != before
    }

    /// Run every pending hook. Failures are logged and do not stop the rest.
    pub fn run_all(&self) {
        let hooks = {
            let mut inner = lock(&self.inner);
            inner.ran = true;
            std::mem::take(&mut inner.hooks)
        };
        tracing::debug!(count = hooks.len(), "running shutdown hooks");
        for (_, name, hook) in hooks {
            run_hook(name, hook);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_run(&self) -> bool {
        lock(&self.inner).ran
    }
}

fn run_hook(name: &'static str, hook: HookFn) {
    match hook() {
        Ok(()) => tracing::debug!(hook = name, "shutdown hook complete"),
        Err(err) => tracing::warn!(hook = name, error = %err, "shutdown hook failed"),
    }
}

/// Observer of session changes. Registered weakly on the service context.
#[async_trait]
pub trait LoginHook: Send + Sync {
    async fn on_login(&self, session: &Session) -> Result<(), DaemonError>;
    async fn on_logout(&self) -> Result<(), DaemonError>;
}

/// Observer of server-side changes to a user's sigchain or profile.
pub trait UserChangedHandler: Send + Sync {
    fn handle_user_changed(&self, uid: &Uid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> HookFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> HookFn {
                let log = Arc::clone(&log);
                Box::new(move || {
                    log.lock().unwrap().push(name);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn hooks_run_in_insertion_order() {
        let hooks = ShutdownHooks::new();
        let (log, make) = recorder();
        hooks.push("lock", make("lock"));
        hooks.push("socket", make("socket"));
        hooks.push("connection", make("connection"));

        hooks.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["lock", "socket", "connection"]);
        assert!(hooks.is_empty());
    }

    #[test]
    fn removed_hook_does_not_run() {
        let hooks = ShutdownHooks::new();
        let (log, make) = recorder();
        let first = hooks.push("first", make("first"));
        hooks.push("second", make("second"));

        assert!(hooks.remove(first));
        assert!(!hooks.remove(first));
        hooks.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn failing_hook_does_not_stop_the_rest() {
        let hooks = ShutdownHooks::new();
        let (log, make) = recorder();
        hooks.push("broken", || {
            Err(DaemonError::ChannelClosed("test"))
        });
        hooks.push("after", make("after"));
        hooks.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn hook_pushed_after_shutdown_runs_immediately() {
        let hooks = ShutdownHooks::new();
        let (log, make) = recorder();
        hooks.run_all();
        hooks.push("late", make("late"));
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
        assert!(hooks.has_run());
    }
}
