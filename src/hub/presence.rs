//! Presence aggregation across all of a user's connections.
//!
//! Exactly one tracker instance is shared by every transport surface;
//! all registries report connection add/remove through the same funnel.
//! Two maps claiming to be the source of truth for the same user's online
//! state is precisely the race this design exists to prevent.
//!
//! State machine per user: offline -> online on the first registered
//! connection, online -> offline when the active set empties AND a grace
//! delay passes without a reconnect. An epoch counter bumped on every
//! add/remove invalidates stale grace timers, which is what makes the
//! offline event fire exactly once per real transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::UserId;

/// Callback invoked on every online/offline transition.
pub type PresenceCallback = Arc<dyn Fn(UserId, bool) + Send + Sync>;

#[derive(Debug, Default)]
struct PresenceEntry {
    connections: usize,
    /// Bumped on every add/remove; a grace timer only finalizes offline
    /// if the epoch it captured is still current.
    epoch: u64,
    online: bool,
}

pub struct PresenceTracker {
    users: Mutex<HashMap<UserId, PresenceEntry>>,
    subscribers: Mutex<Vec<PresenceCallback>>,
    grace: Duration,
}

impl PresenceTracker {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            grace,
        })
    }

    /// Register a callback for online/offline transitions. Callbacks run
    /// outside the tracker's lock, in registration order.
    pub fn subscribe(&self, callback: PresenceCallback) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn on_connection_added(self: &Arc<Self>, user: UserId) {
        let went_online = {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            let entry = users.entry(user).or_default();
            entry.connections += 1;
            entry.epoch += 1;
            let went_online = !entry.online;
            entry.online = true;
            went_online
        };

        if went_online {
            tracing::debug!(user_id = user, "User online");
            self.emit(user, true);
        }
    }

    pub fn on_connection_removed(self: &Arc<Self>, user: UserId) {
        let pending_epoch = {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = users.get_mut(&user) else {
                return;
            };
            entry.connections = entry.connections.saturating_sub(1);
            entry.epoch += 1;
            if entry.connections == 0 {
                Some(entry.epoch)
            } else {
                None
            }
        };

        // Last connection gone: arm a grace timer. A reconnect before it
        // fires bumps the epoch and the timer becomes a no-op.
        if let Some(epoch) = pending_epoch {
            let tracker = Arc::clone(self);
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                tracker.finalize_offline(user, epoch);
            });
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    /// Snapshot of all currently-online users.
    pub fn online_users(&self) -> Vec<UserId> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, e)| e.online)
            .map(|(&u, _)| u)
            .collect()
    }

    fn finalize_offline(self: &Arc<Self>, user: UserId, epoch: u64) {
        let went_offline = {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            let expired = matches!(
                users.get(&user),
                Some(entry) if entry.epoch == epoch && entry.connections == 0 && entry.online
            );
            // Entry removed outright: the map only holds users with live
            // connections or a pending grace timer, so it cannot grow
            // with every user ever seen.
            if expired {
                users.remove(&user);
            }
            expired
        };

        if went_offline {
            tracing::debug!(user_id = user, "User offline after grace period");
            self.emit(user, false);
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    fn emit(&self, user: UserId, online: bool) {
        let subscribers: Vec<PresenceCallback> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in subscribers {
            callback(user, online);
        }
    }
}
