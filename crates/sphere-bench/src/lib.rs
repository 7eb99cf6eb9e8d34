//! Shared fixtures for the Sphere benchmarks.

use chrono::Utc;
use sphere_core::{
    Connection, ConnectionHandle, ConnectionId, Identity, MemoryDirectory, PresenceRegistry,
    ServerEvent, TokenConfig, TokenService, UserDirectory, UserId,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// A connection for `user_id` that was never authenticated over a socket.
#[must_use]
pub fn connection(user_id: UserId, username: &str) -> Connection {
    Connection {
        connection_id: ConnectionId::generate(),
        user_id,
        username: username.to_string(),
        authenticated_at: Utc::now(),
    }
}

/// A registry with `n` online users. The outboxes are returned so pushes
/// keep succeeding.
#[must_use]
pub fn populated_registry(
    n: usize,
) -> (
    PresenceRegistry,
    Vec<UserId>,
    Vec<UnboundedReceiver<ServerEvent>>,
) {
    let registry = PresenceRegistry::new();
    let mut ids = Vec::with_capacity(n);
    let mut outboxes = Vec::with_capacity(n);
    for i in 0..n {
        let id = UserId::new();
        let (handle, outbox) = ConnectionHandle::new(&connection(id, &format!("user{i}")));
        registry.register(handle);
        ids.push(id);
        outboxes.push(outbox);
    }
    (registry, ids, outboxes)
}

/// A token service over a directory holding one identity.
///
/// # Panics
///
/// Never in practice: the directory is empty when the identity is inserted.
pub async fn token_fixture() -> (Arc<TokenService>, UserId) {
    let directory = Arc::new(MemoryDirectory::new());
    let id = directory
        .insert(Identity::new("bench", "bench@example.com", None))
        .await
        .expect("empty directory accepts the bench identity")
        .id;
    let tokens = Arc::new(TokenService::new(
        directory,
        &TokenConfig::new("bench-access-secret", "bench-refresh-secret"),
    ));
    (tokens, id)
}
