//! Durable notifications.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sphere_protocol::{Notification, NotificationKind, UserId, UserSummary};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::directory::UserDirectory;
use crate::error::{Error, Result};

/// Notifications returned per listing.
pub const PAGE_SIZE: usize = 20;

/// Raw notification storage.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn insert(&self, notification: Notification) -> Result<()>;

    /// Up to `limit` notifications for `recipient`, newest first.
    async fn recent(&self, recipient: UserId, limit: usize) -> Result<Vec<Notification>>;

    /// Mark every unread notification of `recipient` as read. Returns how many changed.
    async fn mark_all_read(&self, recipient: UserId) -> Result<usize>;

    async fn unread_count(&self, recipient: UserId) -> Result<usize>;
}

/// In-process [`NotificationLog`].
#[derive(Debug, Default)]
pub struct MemoryNotificationLog {
    by_recipient: RwLock<HashMap<UserId, Vec<Notification>>>,
}

impl MemoryNotificationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationLog for MemoryNotificationLog {
    async fn insert(&self, notification: Notification) -> Result<()> {
        self.by_recipient
            .write()
            .await
            .entry(notification.recipient_id)
            .or_default()
            .push(notification);
        Ok(())
    }

    async fn recent(&self, recipient: UserId, limit: usize) -> Result<Vec<Notification>> {
        let guard = self.by_recipient.read().await;
        // Appended in creation order, so newest first is a reverse walk.
        Ok(guard
            .get(&recipient)
            .map(|list| list.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_all_read(&self, recipient: UserId) -> Result<usize> {
        let mut guard = self.by_recipient.write().await;
        let Some(list) = guard.get_mut(&recipient) else {
            return Ok(0);
        };
        let mut changed = 0;
        for n in list.iter_mut().filter(|n| !n.read) {
            n.read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn unread_count(&self, recipient: UserId) -> Result<usize> {
        Ok(self
            .by_recipient
            .read()
            .await
            .get(&recipient)
            .map_or(0, |list| list.iter().filter(|n| !n.read).count()))
    }
}

/// Input for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient_id: UserId,
    pub sender_id: UserId,
    pub kind: NotificationKind,
    pub related_post_id: Option<String>,
    pub message: String,
}

/// A notification with its sender resolved, as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    /// Absent when the sender no longer exists.
    pub sender: Option<UserSummary>,
}

/// Creates, lists and acknowledges notifications.
pub struct NotificationCenter {
    log: Arc<dyn NotificationLog>,
    directory: Arc<dyn UserDirectory>,
}

impl NotificationCenter {
    #[must_use]
    pub fn new(log: Arc<dyn NotificationLog>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { log, directory }
    }

    /// Persist a notification.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if recipient and sender are the same identity
    /// - `Validation` if the message text is empty
    pub async fn create(&self, new: NewNotification) -> Result<Notification> {
        if new.recipient_id == new.sender_id {
            return Err(Error::InvalidOperation("cannot notify yourself".into()));
        }
        if new.message.trim().is_empty() {
            return Err(Error::Validation("notification message cannot be empty".into()));
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            recipient_id: new.recipient_id,
            sender_id: new.sender_id,
            kind: new.kind,
            related_post_id: new.related_post_id,
            message: new.message,
            read: false,
            created_at: Utc::now(),
        };
        self.log.insert(notification.clone()).await?;
        Ok(notification)
    }

    /// The latest [`PAGE_SIZE`] notifications for `user`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list(&self, user: UserId) -> Result<Vec<NotificationView>> {
        let recent = self.log.recent(user, PAGE_SIZE).await?;

        let mut sender_ids: Vec<UserId> = recent.iter().map(|n| n.sender_id).collect();
        sender_ids.sort_unstable();
        sender_ids.dedup();
        let senders: HashMap<UserId, UserSummary> = self
            .directory
            .summaries(&sender_ids)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        Ok(recent
            .into_iter()
            .map(|notification| {
                let sender = senders.get(&notification.sender_id).cloned();
                NotificationView {
                    notification,
                    sender,
                }
            })
            .collect())
    }

    /// Mark every notification of `user` as read. A second call changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn mark_all_read(&self, user: UserId) -> Result<usize> {
        self.log.mark_all_read(user).await
    }

    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn unread_count(&self, user: UserId) -> Result<usize> {
        self.log.unread_count(user).await
    }
}
