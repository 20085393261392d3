//! Badge counts shown by clients.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::guard::lock;
use crate::router::NotifyRouter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeState {
    pub rekeys_needed: u32,
    pub new_tlfs: u32,
    /// Unread message counts keyed by conversation id.
    pub unread: BTreeMap<String, u32>,
}

impl BadgeState {
    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }
}

/// Holds the badge state and pushes every change to subscribed clients.
pub struct Badger {
    state: Mutex<BadgeState>,
    router: Arc<NotifyRouter>,
}

impl Badger {
    pub fn new(router: Arc<NotifyRouter>) -> Self {
        Self {
            state: Mutex::new(BadgeState::default()),
            router,
        }
    }

    pub fn state(&self) -> BadgeState {
        lock(&self.state).clone()
    }

    pub fn set_rekeys_needed(&self, count: u32) {
        self.update(|s| s.rekeys_needed = count);
    }

    pub fn set_new_tlfs(&self, count: u32) {
        self.update(|s| s.new_tlfs = count);
    }

    pub fn set_unread(&self, conversation: &str, count: u32) {
        self.update(|s| {
            if count == 0 {
                s.unread.remove(conversation);
            } else {
                s.unread.insert(conversation.to_string(), count);
            }
        });
    }

    /// Reset every count, e.g. on logout.
    pub fn clear(&self) {
        self.update(|s| *s = BadgeState::default());
    }

    fn update<F: FnOnce(&mut BadgeState)>(&self, change: F) {
        let snapshot = {
            let mut state = lock(&self.state);
            let before = state.clone();
            change(&mut state);
            if *state == before {
                return;
            }
            state.clone()
        };
        self.router.handle_badge_state(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_counts_sum_and_clear() {
        let badger = Badger::new(Arc::new(NotifyRouter::new()));
        badger.set_unread("conv-a", 2);
        badger.set_unread("conv-b", 3);
        badger.set_rekeys_needed(1);
        assert_eq!(badger.state().total_unread(), 5);

        badger.set_unread("conv-a", 0);
        assert_eq!(badger.state().total_unread(), 3);

        badger.clear();
        assert_eq!(badger.state(), BadgeState::default());
    }
}
