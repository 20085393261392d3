//! Subsystem handles owned by the running service.
//!
//! Optional handles are created during startup (or on first login) and read
//! by login/logout transitions. Transitions serialize on [`ServiceState::transition`];
//! individual handles sit behind short-lived locks so readers never wait on
//! a transition in progress.
//!
//! Shutdown closes the state under the transition lock. A transition that
//! takes the lock afterwards sees [`ServiceState::is_closed`] and starts
//! nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::badger::Badger;
use crate::chat::ChatModules;
use crate::collaborators::RekeyEngine;
use crate::guard::{read, write};
use crate::identifier::BackgroundIdentifier;
use crate::key_upgrade::PerUserKeyBackground;
use crate::push::{PushClient, Reachability};
use crate::rekey::RekeyMaster;
use crate::router::NotifyRouter;

pub struct ServiceState {
    pub badger: Arc<Badger>,
    pub rekey: Arc<RekeyMaster>,
    pub reachability: Arc<Reachability>,
    push: RwLock<Option<Arc<PushClient>>>,
    chat: RwLock<Option<Arc<ChatModules>>>,
    bg_identifier: RwLock<Option<Arc<BackgroundIdentifier>>>,
    key_upgrade: RwLock<Option<Arc<PerUserKeyBackground>>>,
    transition: AsyncMutex<()>,
    closed: AtomicBool,
}

impl ServiceState {
    pub fn new(router: Arc<NotifyRouter>, rekey_engine: Arc<dyn RekeyEngine>) -> Self {
        let badger = Arc::new(Badger::new(router));
        let rekey = Arc::new(RekeyMaster::new(rekey_engine, Arc::clone(&badger)));
        Self {
            badger,
            rekey,
            reachability: Arc::new(Reachability::new()),
            push: RwLock::new(None),
            chat: RwLock::new(None),
            bg_identifier: RwLock::new(None),
            key_upgrade: RwLock::new(None),
            transition: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Held for the duration of a login or logout transition.
    pub async fn transition(&self) -> AsyncMutexGuard<'_, ()> {
        self.transition.lock().await
    }

    /// Refuse further subsystem starts. Call with the transition lock held.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self) -> Option<Arc<PushClient>> {
        read(&self.push).clone()
    }

    pub fn set_push(&self, client: Arc<PushClient>) {
        *write(&self.push) = Some(client);
    }

    pub fn chat(&self) -> Option<Arc<ChatModules>> {
        read(&self.chat).clone()
    }

    pub fn set_chat(&self, chat: Arc<ChatModules>) {
        *write(&self.chat) = Some(chat);
    }

    pub fn bg_identifier(&self) -> Option<Arc<BackgroundIdentifier>> {
        read(&self.bg_identifier).clone()
    }

    pub fn set_bg_identifier(&self, identifier: Arc<BackgroundIdentifier>) {
        *write(&self.bg_identifier) = Some(identifier);
    }

    pub fn key_upgrade(&self) -> Option<Arc<PerUserKeyBackground>> {
        read(&self.key_upgrade).clone()
    }

    pub fn set_key_upgrade(&self, task: Arc<PerUserKeyBackground>) {
        *write(&self.key_upgrade) = Some(task);
    }
}
