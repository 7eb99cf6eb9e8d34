//! Notification rules for social actions.
//!
//! Every action that can notify goes through here, so the self-action and
//! follow-only rules hold at each call site.

use sphere_protocol::{Notification, NotificationKind, UserId};
use std::sync::Arc;

use crate::directory::{FollowOutcome, UserDirectory};
use crate::error::Result;
use crate::notifications::NewNotification;
use crate::router::DeliveryRouter;

/// Longest comment excerpt quoted in a notification, in characters.
const EXCERPT_LEN: usize = 30;

/// Applies follows, likes and comments and emits the resulting notifications.
pub struct Engagement {
    directory: Arc<dyn UserDirectory>,
    router: Arc<DeliveryRouter>,
}

impl Engagement {
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>, router: Arc<DeliveryRouter>) -> Self {
        Self { directory, router }
    }

    /// Toggle `actor` following `target`. Notifies `target` only on a new follow.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` when following yourself
    /// - `NotFound` if either identity does not exist
    pub async fn follow(
        &self,
        actor: UserId,
        target: UserId,
    ) -> Result<(FollowOutcome, Option<Notification>)> {
        let outcome = self.directory.toggle_follow(actor, target).await?;
        if outcome == FollowOutcome::Unfollowed {
            return Ok((outcome, None));
        }

        let username = self.directory.require(actor).await?.username;
        let notification = self
            .notify(
                actor,
                target,
                NotificationKind::Follow,
                None,
                format!("{username} started following you."),
            )
            .await?;
        Ok((outcome, notification))
    }

    /// `actor` liked a post by `post_author`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `actor` does not exist.
    pub async fn liked(
        &self,
        actor: UserId,
        post_author: UserId,
        post_id: &str,
    ) -> Result<Option<Notification>> {
        if actor == post_author {
            return Ok(None);
        }
        let username = self.directory.require(actor).await?.username;
        self.notify(
            actor,
            post_author,
            NotificationKind::Like,
            Some(post_id.to_string()),
            format!("{username} liked your post."),
        )
        .await
    }

    /// `actor` commented `text` on a post by `post_author`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `actor` does not exist.
    pub async fn commented(
        &self,
        actor: UserId,
        post_author: UserId,
        post_id: &str,
        text: &str,
    ) -> Result<Option<Notification>> {
        if actor == post_author {
            return Ok(None);
        }
        let username = self.directory.require(actor).await?.username;
        self.notify(
            actor,
            post_author,
            NotificationKind::Comment,
            Some(post_id.to_string()),
            format!("{username} commented on your post: {}", excerpt(text)),
        )
        .await
    }

    async fn notify(
        &self,
        sender: UserId,
        recipient: UserId,
        kind: NotificationKind,
        related_post_id: Option<String>,
        message: String,
    ) -> Result<Option<Notification>> {
        let (notification, _) = self
            .router
            .route_notification(NewNotification {
                recipient_id: recipient,
                sender_id: sender,
                kind,
                related_post_id,
                message,
            })
            .await?;
        Ok(Some(notification))
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= EXCERPT_LEN {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_LEN).collect();
    format!("{}...", cut.trim_end())
}
