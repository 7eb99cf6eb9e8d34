//! Fan-out of events to live connections.
//!
//! The router owns no state. It resolves recipients through the
//! [`PresenceRegistry`] and pushes on their outbox; anything it cannot push
//! is either already durable or, for typing indicators, intentionally lost.

use sphere_protocol::{ChatMessage, Notification, OnlineUser, ServerEvent, UserId};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::notifications::{NewNotification, NotificationCenter};
use crate::presence::PresenceRegistry;

/// Outcome of a best-effort push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's live connection.
    Delivered,
    /// Recipient has no live connection.
    Offline,
}

impl Delivery {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::Offline => "offline",
        }
    }
}

/// Typing indicator transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typing {
    Start,
    Stop,
}

/// Routes messages, typing indicators, notifications and presence changes.
pub struct DeliveryRouter {
    presence: Arc<PresenceRegistry>,
    notifications: Arc<NotificationCenter>,
}

impl DeliveryRouter {
    #[must_use]
    pub fn new(presence: Arc<PresenceRegistry>, notifications: Arc<NotificationCenter>) -> Self {
        Self {
            presence,
            notifications,
        }
    }

    /// Push a stored message to its receiver, if online.
    pub fn route_message(&self, message: &ChatMessage) -> Delivery {
        let delivery = self.push(message.receiver_id, ServerEvent::ReceiveMessage(message.clone()));
        debug!(
            message = %message.id,
            to = %message.receiver_id,
            outcome = delivery.as_str(),
            "Routed message"
        );
        delivery
    }

    /// Relay a typing indicator. Dropped when the receiver is offline.
    pub fn route_typing(&self, sender: UserId, receiver: UserId, typing: Typing) -> Delivery {
        let event = match typing {
            Typing::Start => ServerEvent::UserTypingStart { sender_id: sender },
            Typing::Stop => ServerEvent::UserTypingStop { sender_id: sender },
        };
        let delivery = self.push(receiver, event);
        trace!(from = %sender, to = %receiver, outcome = delivery.as_str(), "Routed typing");
        delivery
    }

    /// Persist a notification, then push it to the recipient if online.
    ///
    /// # Errors
    ///
    /// Returns the persistence error; nothing is pushed in that case.
    pub async fn route_notification(
        &self,
        new: NewNotification,
    ) -> Result<(Notification, Delivery)> {
        let notification = self.notifications.create(new).await?;
        let delivery = self.push(
            notification.recipient_id,
            ServerEvent::NewNotification(notification.clone()),
        );
        debug!(
            notification = %notification.id,
            kind = %notification.kind,
            to = %notification.recipient_id,
            outcome = delivery.as_str(),
            "Routed notification"
        );
        Ok((notification, delivery))
    }

    /// Announce that `user_id` came online or went offline to every other
    /// live connection. Returns how many connections were reached.
    pub fn route_presence_change(&self, user_id: UserId, username: &str, online: bool) -> usize {
        let user = OnlineUser {
            user_id,
            username: username.to_string(),
        };
        let reached = self
            .presence
            .connections()
            .into_iter()
            .filter(|handle| handle.user_id != user_id)
            .filter(|handle| {
                let event = if online {
                    ServerEvent::UserOnline(user.clone())
                } else {
                    ServerEvent::UserOffline(user.clone())
                };
                handle.push(event).is_ok()
            })
            .count();

        debug!(user = %user_id, online, reached, "Broadcast presence change");
        reached
    }

    fn push(&self, recipient: UserId, event: ServerEvent) -> Delivery {
        match self.presence.lookup(recipient) {
            Some(handle) if handle.push(event).is_ok() => Delivery::Delivered,
            _ => Delivery::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Connection, ConnectionId};
    use crate::directory::{MemoryDirectory, UserDirectory};
    use crate::identity::Identity;
    use crate::notifications::MemoryNotificationLog;
    use crate::presence::ConnectionHandle;
    use chrono::Utc;
    use sphere_protocol::NotificationKind;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        router: DeliveryRouter,
        presence: Arc<PresenceRegistry>,
        center: Arc<NotificationCenter>,
        alice: UserId,
        bob: UserId,
    }

    async fn fixture() -> Fixture {
        let dir = Arc::new(MemoryDirectory::new());
        let alice = dir
            .insert(Identity::new("alice", "alice@example.com", None))
            .await
            .unwrap()
            .id;
        let bob = dir
            .insert(Identity::new("bob", "bob@example.com", None))
            .await
            .unwrap()
            .id;
        let presence = Arc::new(PresenceRegistry::new());
        let center = Arc::new(NotificationCenter::new(
            Arc::new(MemoryNotificationLog::new()),
            dir,
        ));
        Fixture {
            router: DeliveryRouter::new(presence.clone(), center.clone()),
            presence,
            center,
            alice,
            bob,
        }
    }

    fn connect(presence: &PresenceRegistry, user_id: UserId, name: &str) -> UnboundedReceiver<ServerEvent> {
        let (handle, rx) = ConnectionHandle::new(&Connection {
            connection_id: ConnectionId::generate(),
            user_id,
            username: name.into(),
            authenticated_at: Utc::now(),
        });
        presence.register(handle);
        rx
    }

    #[tokio::test]
    async fn test_route_message_online_and_offline() {
        let f = fixture().await;
        let message = ChatMessage::new(f.alice, f.bob, "hello");

        assert_eq!(f.router.route_message(&message), Delivery::Offline);

        let mut rx = connect(&f.presence, f.bob, "bob");
        assert_eq!(f.router.route_message(&message), Delivery::Delivered);
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::ReceiveMessage(message));
    }

    #[tokio::test]
    async fn test_route_typing_dropped_when_offline() {
        let f = fixture().await;
        assert_eq!(f.router.route_typing(f.alice, f.bob, Typing::Start), Delivery::Offline);

        let mut rx = connect(&f.presence, f.bob, "bob");
        f.router.route_typing(f.alice, f.bob, Typing::Start);
        f.router.route_typing(f.alice, f.bob, Typing::Stop);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::UserTypingStart { sender_id: f.alice }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::UserTypingStop { sender_id: f.alice }
        );
    }

    #[tokio::test]
    async fn test_route_notification_persists_before_push() {
        let f = fixture().await;
        let new = NewNotification {
            recipient_id: f.bob,
            sender_id: f.alice,
            kind: NotificationKind::Follow,
            related_post_id: None,
            message: "alice started following you.".into(),
        };

        let (_, delivery) = f.router.route_notification(new.clone()).await.unwrap();
        assert_eq!(delivery, Delivery::Offline);
        assert_eq!(f.center.unread_count(f.bob).await.unwrap(), 1);

        let mut rx = connect(&f.presence, f.bob, "bob");
        let (stored, delivery) = f.router.route_notification(new).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::NewNotification(stored));
        assert_eq!(f.center.unread_count(f.bob).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_route_presence_change_skips_subject() {
        let f = fixture().await;
        let carol = UserId::new();
        let mut alice_rx = connect(&f.presence, f.alice, "alice");
        let mut bob_rx = connect(&f.presence, f.bob, "bob");
        let _carol_rx = connect(&f.presence, carol, "carol");

        let reached = f.router.route_presence_change(f.alice, "alice", false);
        assert_eq!(reached, 2);
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::UserOffline(OnlineUser {
                user_id: f.alice,
                username: "alice".into()
            })
        );
    }
}
