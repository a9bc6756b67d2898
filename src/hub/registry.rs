//! Connection registry: the authoritative map from user to live
//! connections. A user can have multiple concurrent connections
//! (multiple devices/tabs); every surface reports add/remove to the one
//! shared presence tracker.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::RegisterError;
use crate::hub::presence::PresenceTracker;
use crate::protocol::UserId;
use crate::ws::{ConnectionHandle, ConnectionId};

pub struct ConnectionRegistry {
    connections: DashMap<UserId, Vec<ConnectionHandle>>,
    presence: Arc<PresenceTracker>,
    max_conns_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceTracker>, max_conns_per_user: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            presence,
            max_conns_per_user,
        })
    }

    /// Add a connection under the user's active set and notify the
    /// presence tracker. Refused when the per-user cap is reached.
    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RegisterError> {
        let user_id = handle.user_id();
        {
            let mut entry = self.connections.entry(user_id).or_default();
            if entry.len() >= self.max_conns_per_user {
                return Err(RegisterError::ConnectionLimit);
            }
            entry.push(handle);
        }
        // Presence callbacks fan out through this registry; never invoke
        // them while a shard guard is held.
        self.presence.on_connection_added(user_id);

        tracing::debug!(
            user_id,
            connections = self.connection_count(user_id),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a connection by id. Idempotent: unregistering an already
    /// removed connection is a no-op, and the presence tracker is only
    /// notified when a handle was actually removed.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let removed = {
            let Some(mut entry) = self.connections.get_mut(&user_id) else {
                return;
            };
            let before = entry.len();
            entry.retain(|h| h.id() != connection_id);
            before != entry.len()
        };

        self.connections
            .remove_if(&user_id, |_, handles| handles.is_empty());

        if removed {
            self.presence.on_connection_removed(user_id);
            tracing::debug!(user_id, connection_id, "Connection unregistered");
        }
    }

    /// Snapshot of the user's live connections for fan-out. Handles whose
    /// write loop has already gone away are excluded, so fan-out never
    /// addresses a closed connection.
    pub fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.connections
            .get(&user_id)
            .map(|entry| entry.iter().filter(|h| !h.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live connection (global broadcasts, shutdown).
    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|h| !h.is_closed())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.connections
            .get(&user_id)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Force-close every connection (graceful shutdown).
    pub fn close_all(&self) {
        for handle in self.all_connections() {
            handle.close();
        }
    }
}
