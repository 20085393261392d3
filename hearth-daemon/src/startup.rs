//! Background operations launched once the listener is bound.
//!
//! None of these block startup. Each failure is logged where it happens.

use std::sync::{Arc, Weak};
use std::time::Duration;

use hearth_core::Uid;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::chat::ChatModules;
use crate::context::ServiceContext;
use crate::hooks::LoginHook;
use crate::key_upgrade::PerUserKeyBackground;
use crate::push::{PushClient, PushHandler};
use crate::service::Service;
use crate::state::ServiceState;
use crate::transitions;

pub const HOURLY_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Out-of-band push system announcing a changed user. The body is the uid.
pub const USER_CHANGED_SYSTEM: &str = "user.changed";

const MACOS_EXTRA_PATH: &[&str] = &["/usr/local/bin", "/usr/local/MacGPG2/bin"];

pub(crate) fn run_background_operations(service: &Arc<Service>) {
    let ctx = service.context();
    let state = service.state();

    start_hourly_checks(ctx);
    create_chat_modules(ctx, state);
    start_push_client(ctx, state);
    add_global_hooks(service);
    configure_path();
    configure_rekey(ctx, state);
    run_per_user_key_upgrade(ctx, state);
    {
        let state = Arc::clone(state);
        ctx.shutdown_hooks.push("subsystems", move || {
            if let Some(identifier) = state.bg_identifier() {
                identifier.logout();
            }
            state.rekey.shutdown();
            Ok(())
        });
    }

    let ctx = Arc::clone(ctx);
    let state = Arc::clone(state);
    tokio::spawn(async move {
        try_login(&ctx).await;
        {
            let _transition = state.transition().await;
            if state.is_closed() {
                tracing::debug!("service shutting down; skipping startup login");
                return;
            }
            transitions::try_push_connect(&ctx, &state).await;
            if let Some(uid) = ctx.uid().filter(|uid| !uid.is_nil()) {
                state.rekey.login(&uid);
                transitions::start_chat_modules(&state, &uid);
                transitions::run_background_identifier(&ctx, &state, &uid);
            }
        }
        if let Err(err) = transitions::identify_self(&ctx).await {
            tracing::warn!(error = %err, "startup self identify failed");
        }
    });
}

/// Restore a session without user interaction: offline first, then as a
/// provisioned device.
async fn try_login(ctx: &ServiceContext) {
    let auth = &ctx.collaborators.auth;
    let session = match auth.login_offline().await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(error = %err, "offline login failed");
            match auth.login_provisioned_device().await {
                Ok(session) => session,
                Err(err) => {
                    tracing::debug!(error = %err, "provisioned device login failed");
                    return;
                }
            }
        }
    };
    let (uid, username) = (session.uid.clone(), session.username.clone());
    if ctx.restore_session(session) {
        tracing::info!(uid = %uid, username = %username, "restored session");
    } else {
        tracing::debug!("a client logged in first; keeping its session");
    }
}

fn start_hourly_checks(ctx: &Arc<ServiceContext>) {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let ctx_for_task = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut ticker = interval_at(
            Instant::now() + HOURLY_CHECK_INTERVAL,
            HOURLY_CHECK_INTERVAL,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => hourly_checks(&ctx_for_task).await,
            }
        }
        tracing::debug!("hourly checks stopped");
    });
    ctx.shutdown_hooks.push("hourly_checks", move || {
        token.cancel();
        Ok(())
    });
}

pub(crate) async fn hourly_checks(ctx: &ServiceContext) {
    let maintenance = &ctx.collaborators.maintenance;
    if let Err(err) = maintenance.check_tracking().await {
        tracing::warn!(error = %err, "tracking check failed");
    }
    match maintenance.logout_if_revoked().await {
        Ok(true) => {
            tracing::info!("device revoked; logging out");
            if let Err(err) = ctx.collaborators.auth.logout().await {
                tracing::warn!(error = %err, "logout after revoke failed");
            }
            ctx.logout().await;
        }
        Ok(false) => {}
        Err(err) => tracing::warn!(error = %err, "revoke check failed"),
    }
}

fn create_chat_modules(ctx: &ServiceContext, state: &ServiceState) {
    let chat = ChatModules::new(ctx.collaborators.chat_loops.clone());
    tracing::debug!(loops = ?chat.loop_names(), "chat modules created");
    state.set_chat(Arc::new(chat));
}

fn start_push_client(ctx: &Arc<ServiceContext>, state: &ServiceState) {
    if ctx.config.push_disabled {
        tracing::info!("push notifications disabled");
        return;
    }
    let client = PushClient::new(
        Arc::clone(&ctx.collaborators.push_dialer),
        Arc::clone(&ctx.router),
    );
    client.set_reachability(Arc::clone(&state.reachability));
    client.add_handler(Arc::clone(&state.rekey) as Arc<dyn PushHandler>);
    client.add_handler(Arc::new(UserChangedForwarder {
        ctx: Arc::downgrade(ctx),
    }));
    tracing::debug!(handlers = ?client.handler_names(), "push client created");
    state.set_push(Arc::new(client));
}

/// Turns `user.changed` push messages into user-changed notifications.
struct UserChangedForwarder {
    ctx: Weak<ServiceContext>,
}

impl PushHandler for UserChangedForwarder {
    fn name(&self) -> &'static str {
        "user_changed"
    }

    fn on_out_of_band(&self, system: &str, body: &str) {
        if system != USER_CHANGED_SYSTEM {
            return;
        }
        let uid = body.trim();
        if uid.is_empty() {
            tracing::debug!("user changed message without a uid");
            return;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.notify_user_changed(&Uid::from(uid));
        }
    }
}

fn add_global_hooks(service: &Arc<Service>) {
    let hook: Arc<dyn LoginHook> = Arc::clone(service) as Arc<dyn LoginHook>;
    service.context().add_login_hook(Arc::downgrade(&hook));
}

fn configure_path() {
    if !cfg!(target_os = "macos") {
        return;
    }
    let current = std::env::var("PATH").unwrap_or_default();
    let extended = extend_path(&current, MACOS_EXTRA_PATH);
    if extended != current {
        tracing::debug!(path = %extended, "extended PATH");
        std::env::set_var("PATH", extended);
    }
}

/// Append every entry of `extra` missing from `current`.
pub(crate) fn extend_path(current: &str, extra: &[&str]) -> String {
    let mut entries: Vec<&str> = current.split(':').filter(|e| !e.is_empty()).collect();
    for entry in extra {
        if !entries.contains(entry) {
            entries.push(entry);
        }
    }
    entries.join(":")
}

fn configure_rekey(ctx: &ServiceContext, state: &ServiceState) {
    state.rekey.start();
    if let Some(uid) = ctx.uid() {
        state.rekey.login(&uid);
    }
}

fn run_per_user_key_upgrade(ctx: &ServiceContext, state: &ServiceState) {
    if !ctx.config.upgrade_per_user_key {
        tracing::debug!("per-user-key upgrade disabled");
        return;
    }
    let task = Arc::new(PerUserKeyBackground::new(
        Arc::clone(&state.reachability),
        Arc::clone(&ctx.collaborators.key_upgrader),
    ));
    task.run();
    state.set_key_upgrade(Arc::clone(&task));
    ctx.shutdown_hooks.push("per_user_key_upgrade", move || {
        task.shutdown();
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hearth_core::{Config, ForkType, Session};
    use tempfile::TempDir;

    use crate::collaborators::{Collaborators, Maintenance};
    use crate::error::DaemonError;
    use crate::hooks::UserChangedHandler;

    #[test]
    fn path_entries_are_not_duplicated() {
        assert_eq!(
            extend_path("/usr/bin:/usr/local/bin", MACOS_EXTRA_PATH),
            "/usr/bin:/usr/local/bin:/usr/local/MacGPG2/bin"
        );
        assert_eq!(extend_path("", &["/a"]), "/a");
    }

    #[derive(Default)]
    struct Revoked {
        tracked: AtomicUsize,
        revoked: AtomicBool,
    }

    #[async_trait]
    impl Maintenance for Revoked {
        async fn check_tracking(&self) -> Result<(), DaemonError> {
            self.tracked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn logout_if_revoked(&self) -> Result<bool, DaemonError> {
            Ok(self.revoked.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn revoked_device_is_logged_out() {
        let tmp = TempDir::new().unwrap();
        let config = Config::defaults_at(tmp.path());
        let maintenance = Arc::new(Revoked::default());
        let mut collaborators = Collaborators::defaults(&config);
        collaborators.maintenance = maintenance.clone();
        let (ctx, _stop) = ServiceContext::new(config, collaborators, ForkType::None);
        ctx.login(Session::new("u1", "alice")).await;

        hourly_checks(&ctx).await;
        assert!(ctx.is_logged_in());

        maintenance.revoked.store(true, Ordering::SeqCst);
        hourly_checks(&ctx).await;
        assert!(!ctx.is_logged_in());
        assert_eq!(maintenance.tracked.load(Ordering::SeqCst), 2);
    }

    #[derive(Default)]
    struct Seen(std::sync::Mutex<Vec<Uid>>);

    impl UserChangedHandler for Seen {
        fn handle_user_changed(&self, uid: &Uid) {
            self.0.lock().unwrap().push(uid.clone());
        }
    }

    #[test]
    fn user_changed_messages_reach_handlers() {
        let tmp = TempDir::new().unwrap();
        let config = Config::defaults_at(tmp.path());
        let collaborators = Collaborators::defaults(&config);
        let (ctx, _stop) = ServiceContext::new(config, collaborators, ForkType::None);
        let ctx = Arc::new(ctx);
        let seen = Arc::new(Seen::default());
        let handler: Arc<dyn UserChangedHandler> = seen.clone();
        ctx.add_user_changed_handler(Arc::downgrade(&handler));

        let forwarder = UserChangedForwarder {
            ctx: Arc::downgrade(&ctx),
        };
        forwarder.on_out_of_band("kbfs.rekey", "u1");
        forwarder.on_out_of_band(USER_CHANGED_SYSTEM, "  ");
        forwarder.on_out_of_band(USER_CHANGED_SYSTEM, "u2\n");

        assert_eq!(*seen.0.lock().unwrap(), vec![Uid::from("u2")]);
    }

    #[tokio::test]
    async fn per_user_key_task_follows_the_setting() {
        let tmp = TempDir::new().unwrap();
        for enabled in [false, true] {
            let mut config = Config::defaults_at(tmp.path());
            config.upgrade_per_user_key = enabled;
            let collaborators = Collaborators::defaults(&config);
            let (ctx, _stop) = ServiceContext::new(config, collaborators, ForkType::None);
            let state = ServiceState::new(Arc::clone(&ctx.router), Arc::clone(&ctx.collaborators.rekey));

            run_per_user_key_upgrade(&ctx, &state);
            assert_eq!(state.key_upgrade().is_some(), enabled);
            assert_eq!(ctx.shutdown_hooks.len(), usize::from(enabled));

            ctx.shutdown_hooks.run_all();
            if let Some(task) = state.key_upgrade() {
                task.task().wait_stopped().await;
            }
        }
    }
}
