//! Persistent store of identities and the follow graph.

use async_trait::async_trait;
use sphere_protocol::{UserId, UserSummary};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::{Identity, SecretKind};
use crate::secrets::constant_time_eq;

/// A change applied to one identity under the store's write lock.
pub type IdentityChange = Box<dyn FnOnce(&mut Identity) + Send>;

/// Result of toggling a follow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Followed,
    Unfollowed,
}

/// Identity storage.
///
/// Implementations must keep the follow graph symmetric and must apply
/// [`UserDirectory::swap_refresh_hash`] atomically per identity.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Store a new identity.
    ///
    /// Fails with `Conflict` if the username or email is taken.
    async fn insert(&self, identity: Identity) -> Result<Identity>;

    /// Look up an identity by id.
    async fn get(&self, id: UserId) -> Result<Option<Identity>>;

    /// Look up an identity by (normalized) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>>;

    /// Find the identity holding an unexpired pending secret with this hash.
    async fn find_by_secret(&self, kind: SecretKind, hash: &str) -> Result<Option<Identity>>;

    /// Apply `change` to an identity and return the updated record.
    ///
    /// Fails with `NotFound` if the identity does not exist.
    async fn modify(&self, id: UserId, change: IdentityChange) -> Result<Identity>;

    /// Replace the stored refresh hash with `next` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    async fn swap_refresh_hash(&self, id: UserId, expected: &str, next: String) -> Result<bool>;

    /// Follow `target` if `current` does not follow it yet, otherwise unfollow.
    ///
    /// Both sides of the edge change together.
    async fn toggle_follow(&self, current: UserId, target: UserId) -> Result<FollowOutcome>;

    /// Summaries for the given ids. Unknown ids are skipped.
    async fn summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>>;

    /// Look up an identity that must exist.
    async fn require(&self, id: UserId) -> Result<Identity> {
        self.get(id).await?.ok_or(Error::NotFound("identity"))
    }
}

/// In-process [`UserDirectory`].
///
/// A single lock covers every record so multi-record updates such as the
/// follow toggle are atomic.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, Identity>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored identities.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Whether the directory is empty.
    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn insert(&self, identity: Identity) -> Result<Identity> {
        let mut users = self.users.write().await;

        if users.values().any(|u| u.email == identity.email) {
            return Err(Error::Conflict("email is already registered".into()));
        }
        if users.values().any(|u| u.username == identity.username) {
            return Err(Error::Conflict("username is already taken".into()));
        }

        debug!(user = %identity.id, username = %identity.username, "Identity created");
        users.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn get(&self, id: UserId) -> Result<Option<Identity>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_secret(&self, kind: SecretKind, hash: &str) -> Result<Option<Identity>> {
        let now = chrono::Utc::now();
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| {
                u.pending(kind)
                    .is_some_and(|s| !s.is_expired(now) && constant_time_eq(&s.hash, hash))
            })
            .cloned())
    }

    async fn modify(&self, id: UserId, change: IdentityChange) -> Result<Identity> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(Error::NotFound("identity"))?;
        change(user);
        Ok(user.clone())
    }

    async fn swap_refresh_hash(&self, id: UserId, expected: &str, next: String) -> Result<bool> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(Error::NotFound("identity"))?;

        match user.refresh_token_hash.as_deref() {
            Some(current) if constant_time_eq(current, expected) => {
                user.refresh_token_hash = Some(next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn toggle_follow(&self, current: UserId, target: UserId) -> Result<FollowOutcome> {
        if current == target {
            return Err(Error::InvalidOperation("you cannot follow yourself".into()));
        }

        let mut users = self.users.write().await;
        if !users.contains_key(&current) {
            return Err(Error::NotFound("identity"));
        }
        if !users.contains_key(&target) {
            return Err(Error::NotFound("target identity"));
        }

        let following = users
            .get(&current)
            .is_some_and(|u| u.following.contains(&target));

        // Set operations keep each side idempotent even if the graph drifted.
        let outcome = if following {
            if let Some(u) = users.get_mut(&current) {
                u.following.remove(&target);
            }
            if let Some(u) = users.get_mut(&target) {
                u.followers.remove(&current);
            }
            FollowOutcome::Unfollowed
        } else {
            if let Some(u) = users.get_mut(&current) {
                u.following.insert(target);
            }
            if let Some(u) = users.get_mut(&target) {
                u.followers.insert(current);
            }
            FollowOutcome::Followed
        };

        debug!(from = %current, to = %target, ?outcome, "Follow toggled");
        Ok(outcome)
    }

    async fn summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>> {
        let users = self.users.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(Identity::summary))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(names: &[&str]) -> (MemoryDirectory, Vec<UserId>) {
        let dir = MemoryDirectory::new();
        let mut ids = Vec::new();
        for name in names {
            let identity = Identity::new(*name, format!("{name}@example.com"), None);
            ids.push(dir.insert(identity).await.unwrap().id);
        }
        (dir, ids)
    }

    fn assert_symmetric(a: &Identity, b: &Identity) {
        assert_eq!(a.following.contains(&b.id), b.followers.contains(&a.id));
        assert_eq!(b.following.contains(&a.id), a.followers.contains(&b.id));
    }

    #[tokio::test]
    async fn test_insert_conflicts() {
        let (dir, _) = seeded(&["alice"]).await;

        let same_email = Identity::new("alice2", "alice@example.com", None);
        assert!(matches!(dir.insert(same_email).await, Err(Error::Conflict(_))));

        let same_name = Identity::new("alice", "other@example.com", None);
        assert!(matches!(dir.insert(same_name).await, Err(Error::Conflict(_))));

        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_toggle_follow_symmetry() {
        let (dir, ids) = seeded(&["alice", "bob"]).await;
        let (a, b) = (ids[0], ids[1]);

        assert_eq!(dir.toggle_follow(a, b).await.unwrap(), FollowOutcome::Followed);
        let (ua, ub) = (dir.require(a).await.unwrap(), dir.require(b).await.unwrap());
        assert!(ua.following.contains(&b));
        assert!(ub.followers.contains(&a));
        assert_symmetric(&ua, &ub);

        assert_eq!(dir.toggle_follow(b, a).await.unwrap(), FollowOutcome::Followed);
        assert_eq!(dir.toggle_follow(a, b).await.unwrap(), FollowOutcome::Unfollowed);

        let (ua, ub) = (dir.require(a).await.unwrap(), dir.require(b).await.unwrap());
        assert!(!ua.following.contains(&b));
        assert!(ub.following.contains(&a));
        assert_symmetric(&ua, &ub);
    }

    #[tokio::test]
    async fn test_toggle_follow_twice_restores_state() {
        let (dir, ids) = seeded(&["alice", "bob"]).await;
        let before = dir.require(ids[0]).await.unwrap();

        dir.toggle_follow(ids[0], ids[1]).await.unwrap();
        dir.toggle_follow(ids[0], ids[1]).await.unwrap();

        let after = dir.require(ids[0]).await.unwrap();
        assert_eq!(before.following, after.following);
        assert!(dir.require(ids[1]).await.unwrap().followers.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_follow_rejects_self_and_unknown() {
        let (dir, ids) = seeded(&["alice"]).await;

        assert!(matches!(
            dir.toggle_follow(ids[0], ids[0]).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            dir.toggle_follow(UserId::new(), ids[0]).await,
            Err(Error::NotFound("identity"))
        ));
        assert!(matches!(
            dir.toggle_follow(ids[0], UserId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_swap_refresh_hash() {
        let (dir, ids) = seeded(&["alice"]).await;
        let id = ids[0];

        assert!(!dir.swap_refresh_hash(id, "old", "new".into()).await.unwrap());

        dir.modify(id, Box::new(|u: &mut Identity| u.refresh_token_hash = Some("old".into())))
            .await
            .unwrap();

        assert!(dir.swap_refresh_hash(id, "old", "new".into()).await.unwrap());
        assert!(!dir.swap_refresh_hash(id, "old", "newer".into()).await.unwrap());
        assert_eq!(
            dir.require(id).await.unwrap().refresh_token_hash.as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_summaries_skip_unknown() {
        let (dir, ids) = seeded(&["alice", "bob"]).await;
        let summaries = dir
            .summaries(&[ids[1], UserId::new(), ids[0]])
            .await
            .unwrap();

        let names: Vec<_> = summaries.iter().map(|s| s.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "alice"]);
    }
}
