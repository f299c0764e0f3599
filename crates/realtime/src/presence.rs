//! Process-wide map of connected identities and their connections.
//!
//! Lock order is `identities` then `connections`. Presence broadcasts for an
//! identity are queued while its `identities` entry is held, so every observer
//! sees that identity's transitions in the same order they were applied.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use shared::{
    domain::{ConnectionId, PresenceStatus, UserId},
    protocol::{PresenceEntry, ServerEvent},
};
use tracing::{info, warn};

use crate::connection::ConnectionHandle;

#[derive(Debug)]
struct IdentityPresence {
    display_name: String,
    status: PresenceStatus,
    connections: HashSet<ConnectionId>,
}

/// Result of removing a connection from the registry.
#[derive(Debug)]
pub struct Unregistered {
    pub handle: Arc<ConnectionHandle>,
    /// Set when this was the identity's last connection.
    pub went_offline: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    identities: DashMap<UserId, IdentityPresence>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the connection and releases it with the online snapshot.
    /// Returns the identity's status after registration.
    pub fn register(&self, handle: &Arc<ConnectionHandle>) -> PresenceStatus {
        let user_id = handle.identity.user_id;
        let status = {
            let mut presence = self
                .identities
                .entry(user_id)
                .or_insert_with(|| IdentityPresence {
                    display_name: handle.identity.display_name.clone(),
                    status: PresenceStatus::Online,
                    connections: HashSet::new(),
                });
            let first = presence.connections.is_empty();
            presence.connections.insert(handle.id);
            self.connections.insert(handle.id, Arc::clone(handle));

            if first {
                presence.status = PresenceStatus::Online;
                presence.display_name = handle.identity.display_name.clone();
                self.broadcast_except(
                    user_id,
                    ServerEvent::PresenceOnline {
                        user_id,
                        display_name: presence.display_name.clone(),
                        status: PresenceStatus::Online,
                    },
                );
                info!(user_id = user_id.0, "identity online");
            }
            presence.status
        };

        let online = self.online_snapshot(user_id);
        handle.release(ServerEvent::Ready {
            user: PresenceEntry {
                user_id,
                display_name: handle.identity.display_name.clone(),
                status,
            },
            online,
        });
        status
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Unregistered> {
        let handle = self
            .connections
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))?;
        let user_id = handle.identity.user_id;

        let mut went_offline = None;
        match self.identities.entry(user_id) {
            Entry::Occupied(mut presence) => {
                presence.get_mut().connections.remove(&connection_id);
                self.connections.remove(&connection_id);
                if presence.get().connections.is_empty() {
                    let last_seen = Utc::now();
                    if presence.get().status.as_observed() != PresenceStatus::Offline {
                        self.broadcast_except(
                            user_id,
                            ServerEvent::PresenceOffline {
                                user_id,
                                last_seen,
                            },
                        );
                    }
                    presence.remove();
                    info!(user_id = user_id.0, "identity offline");
                    went_offline = Some(last_seen);
                }
            }
            Entry::Vacant(_) => {
                self.connections.remove(&connection_id);
            }
        }

        Some(Unregistered {
            handle,
            went_offline,
        })
    }

    /// Updates an online identity's status. Returns false if the identity has no connection.
    pub fn set_status(&self, user_id: UserId, status: PresenceStatus) -> bool {
        let Some(mut presence) = self.identities.get_mut(&user_id) else {
            return false;
        };
        let previous = presence.status.as_observed();
        presence.status = status;
        let observed = status.as_observed();
        if previous == observed {
            return true;
        }
        // Observers that connected while the identity was invisible have no entry for it.
        let event = if previous == PresenceStatus::Offline {
            ServerEvent::PresenceOnline {
                user_id,
                display_name: presence.display_name.clone(),
                status: observed,
            }
        } else {
            ServerEvent::PresenceStatusChanged {
                user_id,
                status: observed,
            }
        };
        self.broadcast_except(user_id, event);
        true
    }

    pub fn status(&self, user_id: UserId) -> PresenceStatus {
        self.identities
            .get(&user_id)
            .map(|presence| presence.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn handle(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self
            .identities
            .get(&user_id)
            .map(|presence| presence.connections.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.handle(id))
            .collect()
    }

    /// Identities visible to `viewer`: everyone else that is not invisible.
    pub fn online_snapshot(&self, viewer: UserId) -> Vec<PresenceEntry> {
        let mut online: Vec<PresenceEntry> = self
            .identities
            .iter()
            .filter(|entry| *entry.key() != viewer)
            .filter(|entry| entry.status.as_observed() != PresenceStatus::Offline)
            .map(|entry| PresenceEntry {
                user_id: *entry.key(),
                display_name: entry.display_name.clone(),
                status: entry.status,
            })
            .collect();
        online.sort_by_key(|entry| entry.user_id);
        online
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn online_count(&self) -> usize {
        self.identities.len()
    }

    fn broadcast_except(&self, user_id: UserId, event: ServerEvent) {
        for entry in self.connections.iter() {
            let handle = entry.value();
            if handle.identity.user_id == user_id {
                continue;
            }
            if !handle.deliver(event.clone()) {
                warn!(
                    connection_id = %handle.id,
                    user_id = handle.identity.user_id.0,
                    "dropping presence event for closed connection"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
