//! Direct message persistence and history queries.

use async_trait::async_trait;
use sphere_protocol::{ChatMessage, UserId, UserSummary};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::directory::UserDirectory;
use crate::error::{Error, Result};

/// Raw message storage.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Persist a message.
    async fn insert(&self, message: ChatMessage) -> Result<()>;

    /// Messages between `a` and `b` in both directions, oldest first.
    async fn between(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>>;

    /// Everyone `user` has sent a message to or received one from.
    async fn counterparts(&self, user: UserId) -> Result<Vec<UserId>>;

    /// Mark messages from `sender` to `reader` as read. Returns how many changed.
    async fn mark_read(&self, reader: UserId, sender: UserId) -> Result<usize>;
}

/// In-process [`MessageLog`] keeping messages in insertion order.
#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn insert(&self, message: ChatMessage) -> Result<()> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn between(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>> {
        let mut history: Vec<ChatMessage> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        history.sort_by_key(|m| m.created_at);
        Ok(history)
    }

    async fn counterparts(&self, user: UserId) -> Result<Vec<UserId>> {
        let set: BTreeSet<UserId> = self
            .messages
            .read()
            .await
            .iter()
            .filter_map(|m| {
                if m.sender_id == user {
                    Some(m.receiver_id)
                } else if m.receiver_id == user {
                    Some(m.sender_id)
                } else {
                    None
                }
            })
            .collect();
        Ok(set.into_iter().collect())
    }

    async fn mark_read(&self, reader: UserId, sender: UserId) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let mut changed = 0;
        for m in messages
            .iter_mut()
            .filter(|m| m.receiver_id == reader && m.sender_id == sender && !m.is_read)
        {
            m.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }
}

/// Validated access to direct messages.
pub struct MessageStore {
    log: Arc<dyn MessageLog>,
    directory: Arc<dyn UserDirectory>,
}

impl MessageStore {
    /// Create a store over `log`, resolving identities through `directory`.
    #[must_use]
    pub fn new(log: Arc<dyn MessageLog>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { log, directory }
    }

    /// Persist a message from `sender` to `receiver`.
    ///
    /// The message is durable once this returns, whether or not the receiver
    /// is online.
    ///
    /// # Errors
    ///
    /// - `Validation` if the content is empty or only whitespace
    /// - `NotFound` if the receiver does not exist
    pub async fn append(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<ChatMessage> {
        if content.trim().is_empty() {
            return Err(Error::Validation("message content cannot be empty".into()));
        }
        if self.directory.get(receiver).await?.is_none() {
            return Err(Error::NotFound("recipient"));
        }

        let message = ChatMessage::new(sender, receiver, content);
        self.log.insert(message.clone()).await?;

        debug!(message = %message.id, from = %sender, to = %receiver, "Message stored");
        Ok(message)
    }

    /// Full conversation between two users, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log fails.
    pub async fn history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>> {
        self.log.between(a, b).await
    }

    /// People `user` can chat with: everyone they follow plus everyone they
    /// have exchanged a message with, excluding themselves, ordered by
    /// username.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `user` does not exist.
    pub async fn conversation_partners(&self, user: UserId) -> Result<Vec<UserSummary>> {
        let identity = self.directory.require(user).await?;

        let mut ids: BTreeSet<UserId> = identity.following;
        ids.extend(self.log.counterparts(user).await?);
        ids.remove(&user);

        let ids: Vec<UserId> = ids.into_iter().collect();
        let mut partners = self.directory.summaries(&ids).await?;
        partners.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(partners)
    }

    /// Mark everything `partner` sent to `reader` as read.
    ///
    /// # Errors
    ///
    /// Returns an error if the log fails.
    pub async fn mark_conversation_read(&self, reader: UserId, partner: UserId) -> Result<usize> {
        self.log.mark_read(reader, partner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::identity::Identity;

    async fn setup(names: &[&str]) -> (MessageStore, Arc<MemoryDirectory>, Vec<UserId>) {
        let dir = Arc::new(MemoryDirectory::new());
        let mut ids = Vec::new();
        for name in names {
            let identity = Identity::new(*name, format!("{name}@example.com"), None);
            ids.push(dir.insert(identity).await.unwrap().id);
        }
        let store = MessageStore::new(Arc::new(MemoryMessageLog::new()), dir.clone());
        (store, dir, ids)
    }

    #[tokio::test]
    async fn test_append_rejects_empty() {
        let (store, _, ids) = setup(&["alice", "bob"]).await;

        assert!(matches!(
            store.append(ids[0], ids[1], "").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.append(ids[0], ids[1], "   \n").await,
            Err(Error::Validation(_))
        ));
        assert!(store.history(ids[0], ids[1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_keeps_content_verbatim() {
        let (store, _, ids) = setup(&["alice", "bob"]).await;

        let body = "    fn main() {}\n";
        let message = store.append(ids[0], ids[1], body).await.unwrap();
        assert_eq!(message.content, body);

        let history = store.history(ids[1], ids[0]).await.unwrap();
        assert_eq!(history[0].content, body);
    }

    #[tokio::test]
    async fn test_append_unknown_receiver() {
        let (store, _, ids) = setup(&["alice"]).await;
        assert!(matches!(
            store.append(ids[0], UserId::new(), "hi").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_both_directions_in_order() {
        let (store, _, ids) = setup(&["alice", "bob", "carol"]).await;
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        store.append(a, b, "one").await.unwrap();
        store.append(b, a, "two").await.unwrap();
        store.append(a, c, "elsewhere").await.unwrap();
        store.append(a, b, "three").await.unwrap();

        let history = store.history(b, a).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_conversation_partners() {
        let (store, dir, ids) = setup(&["alice", "bob", "carol", "dave"]).await;
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);

        // alice follows carol, messaged bob, and bob follows dave.
        dir.toggle_follow(a, c).await.unwrap();
        dir.toggle_follow(b, d).await.unwrap();
        store.append(a, b, "hi").await.unwrap();
        store.append(c, a, "hey").await.unwrap();
        store.append(a, a, "note to self").await.unwrap();

        let partners: Vec<_> = store
            .conversation_partners(a)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.username)
            .collect();
        assert_eq!(partners, vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_mark_conversation_read() {
        let (store, _, ids) = setup(&["alice", "bob"]).await;
        let (a, b) = (ids[0], ids[1]);

        store.append(b, a, "one").await.unwrap();
        store.append(b, a, "two").await.unwrap();
        store.append(a, b, "reply").await.unwrap();

        assert_eq!(store.mark_conversation_read(a, b).await.unwrap(), 2);
        assert_eq!(store.mark_conversation_read(a, b).await.unwrap(), 0);

        let history = store.history(a, b).await.unwrap();
        assert!(history.iter().filter(|m| m.receiver_id == a).all(|m| m.is_read));
        assert!(history.iter().filter(|m| m.receiver_id == b).all(|m| !m.is_read));
    }
}
