//! Online presence registry.
//!
//! Maps each online identity to the connection that currently receives its
//! pushes. A newer connection for the same identity supersedes the older one;
//! the older socket stays open but is no longer a delivery target.

use dashmap::DashMap;
use sphere_protocol::{OnlineUser, ServerEvent, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::{Connection, ConnectionId};
use crate::error::{Error, Result};

/// A live connection that events can be pushed to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle for `connection` and the receiving end of its outbox.
    #[must_use]
    pub fn new(connection: &Connection) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            connection_id: connection.connection_id.clone(),
            user_id: connection.user_id,
            username: connection.username.clone(),
            sender,
        };
        (handle, receiver)
    }

    /// Queue an event for this connection.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryUnavailable` if the connection's outbox is gone.
    pub fn push(&self, event: ServerEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| Error::DeliveryUnavailable(self.user_id))
    }

    /// Whether the connection is still accepting events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Summary for presence listings.
    #[must_use]
    pub fn online_user(&self) -> OnlineUser {
        OnlineUser {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

struct PresenceEntry {
    handle: ConnectionHandle,
    /// Registration order, used to keep snapshots stable.
    seq: u64,
}

/// Registry of online identities.
///
/// Every mutation for a given identity goes through the map's per-key lock,
/// so a connect and a disconnect for the same identity never interleave.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
    next_seq: AtomicU64,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the delivery target for its identity.
    ///
    /// Returns the superseded handle, if the identity was already online.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let user_id = handle.user_id;
        let connection_id = handle.connection_id.clone();

        let previous = self
            .entries
            .insert(user_id, PresenceEntry { handle, seq })
            .map(|entry| entry.handle);

        match &previous {
            Some(old) => debug!(
                user = %user_id,
                connection = %connection_id,
                superseded = %old.connection_id,
                "Presence: connection superseded"
            ),
            None => debug!(user = %user_id, connection = %connection_id, "Presence: online"),
        }

        previous
    }

    /// Remove the identity's entry if it still belongs to `connection_id`.
    ///
    /// A stale disconnect never evicts a newer connection. Returns whether an
    /// entry was removed.
    pub fn unregister(&self, user_id: UserId, connection_id: &ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(&user_id, |_, entry| &entry.handle.connection_id == connection_id)
            .is_some();

        if removed {
            debug!(user = %user_id, connection = %connection_id, "Presence: offline");
        }
        removed
    }

    /// The connection currently receiving pushes for `user_id`.
    #[must_use]
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.entries.get(&user_id).map(|e| e.handle.clone())
    }

    /// Everyone online, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OnlineUser> {
        let mut online: Vec<(u64, OnlineUser)> = self
            .entries
            .iter()
            .map(|e| (e.seq, e.handle.online_user()))
            .collect();
        online.sort_by_key(|(seq, _)| *seq);
        online.into_iter().map(|(_, user)| user).collect()
    }

    /// Handles of every registered connection, for broadcasts.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.entries.iter().map(|e| e.handle.clone()).collect()
    }

    /// Number of online identities.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if an identity is online.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn connection(user_id: UserId, username: &str) -> Connection {
        Connection {
            connection_id: ConnectionId::generate(),
            user_id,
            username: username.into(),
            authenticated_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = PresenceRegistry::new();
        let alice = UserId::new();
        let (handle, _rx) = ConnectionHandle::new(&connection(alice, "alice"));
        let conn_id = handle.connection_id.clone();

        assert!(registry.register(handle).is_none());
        assert!(registry.is_online(alice));
        assert_eq!(registry.lookup(alice).unwrap().connection_id, conn_id);

        assert!(registry.unregister(alice, &conn_id));
        assert!(registry.lookup(alice).is_none());
        assert!(!registry.unregister(alice, &conn_id));
    }

    #[test]
    fn test_last_connect_wins() {
        let registry = PresenceRegistry::new();
        let alice = UserId::new();
        let (old, _rx1) = ConnectionHandle::new(&connection(alice, "alice"));
        let (new, _rx2) = ConnectionHandle::new(&connection(alice, "alice"));
        let (old_id, new_id) = (old.connection_id.clone(), new.connection_id.clone());

        registry.register(old);
        let superseded = registry.register(new).unwrap();
        assert_eq!(superseded.connection_id, old_id);

        // The stale disconnect must not evict the newer connection.
        assert!(!registry.unregister(alice, &old_id));
        assert_eq!(registry.lookup(alice).unwrap().connection_id, new_id);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = PresenceRegistry::new();
        let mut receivers = Vec::new();
        let names = ["carol", "alice", "bob"];
        for name in names {
            let (handle, rx) = ConnectionHandle::new(&connection(UserId::new(), name));
            receivers.push(rx);
            registry.register(handle);
        }

        let snapshot: Vec<_> = registry.snapshot().into_iter().map(|u| u.username).collect();
        assert_eq!(snapshot, names);
    }

    #[tokio::test]
    async fn test_push_and_closed_outbox() {
        let alice = UserId::new();
        let (handle, mut rx) = ConnectionHandle::new(&connection(alice, "alice"));

        handle
            .push(ServerEvent::UserTypingStart { sender_id: UserId::new() })
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::UserTypingStart { .. })
        ));

        drop(rx);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.push(ServerEvent::OnlineUsers(vec![])),
            Err(Error::DeliveryUnavailable(id)) if id == alice
        ));
    }

    #[test]
    fn test_concurrent_connect_disconnect() {
        use std::sync::Arc;

        let registry = Arc::new(PresenceRegistry::new());
        let alice = UserId::new();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let (handle, _rx) = ConnectionHandle::new(&connection(alice, "alice"));
                        let id = handle.connection_id.clone();
                        registry.register(handle);
                        registry.unregister(alice, &id);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // The last register is always followed by its own unregister.
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connections_lists_handles() {
        let registry = PresenceRegistry::new();
        let (a, _ra) = ConnectionHandle::new(&connection(UserId::new(), "a"));
        let (b, _rb) = ConnectionHandle::new(&connection(UserId::new(), "b"));
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.connections().len(), 2);
        assert!(!registry.is_empty());
    }
}
