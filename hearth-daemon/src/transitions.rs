//! Login/logout transitions and the subsystem steps they share with startup.
//!
//! Every step tolerates a subsystem that does not exist yet: a login that
//! arrives before startup has created the chat modules simply skips them,
//! and startup starts them later for whoever is logged in by then.

use std::sync::Arc;

use hearth_core::{Session, Uid};

use crate::collaborators::FullUser;
use crate::context::ServiceContext;
use crate::error::DaemonError;
use crate::hooks::UserChangedHandler;
use crate::identifier::{BackgroundIdentifier, BG_IDENTIFIER_SCHEDULE};
use crate::push::PushUri;
use crate::state::ServiceState;

pub(crate) async fn on_login(ctx: &Arc<ServiceContext>, state: &ServiceState, session: &Session) {
    let _transition = state.transition().await;
    let uid = &session.uid;
    if state.is_closed() {
        tracing::debug!(uid = %uid, "service shutting down; ignoring login");
        return;
    }
    tracing::info!(uid = %uid, username = %session.username, "handling login");

    state.rekey.login(uid);
    if let Err(err) = push_connect(ctx, state).await {
        tracing::warn!(error = %err, "push connect on login failed");
    }

    if uid.is_nil() {
        tracing::debug!("nil uid; skipping per-user subsystems");
        return;
    }
    start_chat_modules(state, uid);
    run_background_identifier(ctx, state, uid);

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(err) = identify_self(&ctx).await {
            tracing::warn!(error = %err, "self identify after login failed");
        }
    });
}

pub(crate) async fn on_logout(state: &ServiceState) {
    let _transition = state.transition().await;
    tracing::info!("handling logout");

    if let Some(push) = state.push() {
        push.shutdown().await;
    }
    stop_chat_modules(state).await;
    state.rekey.logout();
    state.badger.clear();
    if let Some(identifier) = state.bg_identifier() {
        identifier.logout();
    }
}

/// Close the state once any transition in progress has finished, then stop
/// the chat modules. Runs before the shutdown hooks.
pub(crate) async fn on_shutdown(state: &ServiceState) {
    let _transition = state.transition().await;
    state.close();
    stop_chat_modules(state).await;
}

/// Connect (or reconnect) the push client to the configured server.
/// A disabled push client is not an error.
pub(crate) async fn push_connect(ctx: &ServiceContext, state: &ServiceState) -> Result<(), DaemonError> {
    let Some(push) = state.push() else {
        tracing::debug!("push client disabled; not connecting");
        return Ok(());
    };
    let uri = PushUri::parse(&ctx.config.push_uri)?;
    push.connect(&uri).await
}

/// [`push_connect`] only when someone is logged in.
pub(crate) async fn try_push_connect(ctx: &ServiceContext, state: &ServiceState) {
    if !ctx.is_logged_in() {
        tracing::debug!("not logged in; skipping push connect");
        return;
    }
    if let Err(err) = push_connect(ctx, state).await {
        tracing::warn!(error = %err, "push connect failed");
    }
}

pub(crate) fn start_chat_modules(state: &ServiceState, uid: &Uid) -> bool {
    let Some(chat) = state.chat() else {
        tracing::debug!(uid = %uid, "chat modules not created yet; skipping start");
        return false;
    };
    chat.start(uid)
}

pub(crate) async fn stop_chat_modules(state: &ServiceState) {
    match state.chat() {
        Some(chat) => chat.stop().await,
        None => tracing::debug!("chat modules not created yet; nothing to stop"),
    }
}

pub(crate) fn run_background_identifier(ctx: &ServiceContext, state: &ServiceState, uid: &Uid) {
    if ctx.config.bg_identifier_disabled {
        tracing::debug!("background identifier disabled");
        return;
    }
    let existing = state.bg_identifier();
    match BackgroundIdentifier::start_or_reuse(
        existing.as_ref(),
        uid,
        Arc::clone(&ctx.collaborators.identify),
        BG_IDENTIFIER_SCHEDULE,
    ) {
        Ok(Some(identifier)) => {
            let handler: Arc<dyn UserChangedHandler> = identifier.clone();
            ctx.add_user_changed_handler(Arc::downgrade(&handler));
            state.set_bg_identifier(identifier);
        }
        Ok(None) => tracing::debug!(uid = %uid, "background identifier already running"),
        Err(err) => tracing::warn!(uid = %uid, error = %err, "background identifier not started"),
    }
}

/// Identify the logged-in user and cache the result as the full self.
///
/// Returns `Ok(None)` when nobody is logged in or the identify loaded no
/// matching user.
pub async fn identify_self(ctx: &ServiceContext) -> Result<Option<FullUser>, DaemonError> {
    let Some(uid) = ctx.uid() else {
        tracing::debug!("identify self skipped; not logged in");
        return Ok(None);
    };
    tracing::debug!(uid = %uid, "identifying self");
    let outcome = ctx.collaborators.identify.identify_self(&uid).await?;
    let loaded = [outcome.them, outcome.me]
        .into_iter()
        .flatten()
        .find(|user| user.uid == uid);
    match &loaded {
        Some(user) => ctx.set_full_self(user.clone()),
        None => tracing::debug!(uid = %uid, "identify self loaded no matching user"),
    }
    Ok(loaded)
}
