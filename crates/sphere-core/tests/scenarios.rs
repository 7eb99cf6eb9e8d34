//! End-to-end behavior of accounts, tokens, the gateway and engagement
//! wired together the way the server wires them.

use sphere_core::{
    AccountService, AccountSettings, DeliveryRouter, Engagement, Error, FollowOutcome, Gateway,
    GatewayAuth, LogNotifier, MemoryDirectory, MemoryMessageLog, MemoryNotificationLog,
    MessageStore, NewAccount, NotificationCenter, NotificationKind, OnlineUser,
    PresenceRegistry, ServerEvent, TokenConfig, TokenService, UserDirectory, UserId,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct World {
    directory: Arc<MemoryDirectory>,
    tokens: Arc<TokenService>,
    accounts: AccountService,
    gateway: Arc<Gateway>,
    messages: Arc<MessageStore>,
    notifications: Arc<NotificationCenter>,
    engagement: Engagement,
}

impl World {
    fn new() -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let tokens = Arc::new(TokenService::new(
            directory.clone(),
            &TokenConfig::new("scenario-access", "scenario-refresh"),
        ));
        let accounts = AccountService::new(
            directory.clone(),
            tokens.clone(),
            Arc::new(LogNotifier::new()),
            AccountSettings::default(),
        );
        let presence = Arc::new(PresenceRegistry::new());
        let notifications = Arc::new(NotificationCenter::new(
            Arc::new(MemoryNotificationLog::new()),
            directory.clone(),
        ));
        let router = Arc::new(DeliveryRouter::new(presence.clone(), notifications.clone()));
        let messages = Arc::new(MessageStore::new(
            Arc::new(MemoryMessageLog::new()),
            directory.clone(),
        ));
        let gateway = Arc::new(Gateway::new(
            GatewayAuth::new(tokens.clone()),
            presence,
            messages.clone(),
            router.clone(),
        ));
        let engagement = Engagement::new(directory.clone(), router);

        Self {
            directory,
            tokens,
            accounts,
            gateway,
            messages,
            notifications,
            engagement,
        }
    }

    async fn register(&self, name: &str) -> UserId {
        self.accounts
            .register(NewAccount {
                username: name.into(),
                email: format!("{name}@example.com"),
                password: "password-123".into(),
            })
            .await
            .unwrap()
            .id
    }

    async fn access_token(&self, id: UserId) -> String {
        self.tokens.issue(id).await.unwrap().access_token
    }
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn refresh_rotation_rejects_the_previous_token() {
    let world = World::new();
    world.register("alice").await;

    let (_, original) = world
        .accounts
        .login("alice@example.com", "password-123")
        .await
        .unwrap();

    let rotated = world.accounts.refresh(&original.refresh_token).await.unwrap();
    assert!(!rotated.access_token.is_empty());
    assert_ne!(rotated.refresh_token, original.refresh_token);

    let replay = world.accounts.refresh(&original.refresh_token).await.unwrap_err();
    assert!(matches!(replay, Error::TokenMismatch));
    assert_eq!(
        replay.public_message(),
        Error::Unauthenticated("x".into()).public_message()
    );

    // The rotated token is still the live one.
    world.accounts.refresh(&rotated.refresh_token).await.unwrap();
}

#[tokio::test]
async fn disconnect_removes_presence_and_notifies_others() {
    let world = World::new();
    let alice = world.register("alice").await;
    let bob = world.register("bob").await;
    let carol = world.register("carol").await;

    let (alice_session, _alice_rx) = world
        .gateway
        .connect(Some(&world.access_token(alice).await))
        .unwrap();
    let (_bob_session, mut bob_rx) = world
        .gateway
        .connect(Some(&world.access_token(bob).await))
        .unwrap();
    let (_carol_session, mut carol_rx) = world
        .gateway
        .connect(Some(&world.access_token(carol).await))
        .unwrap();

    let online: Vec<UserId> = world
        .gateway
        .presence()
        .snapshot()
        .into_iter()
        .map(|u| u.user_id)
        .collect();
    assert_eq!(online, vec![alice, bob, carol]);
    drain(&mut bob_rx);
    drain(&mut carol_rx);

    drop(alice_session);

    assert!(world.gateway.presence().lookup(alice).is_none());
    assert!(!world
        .gateway
        .presence()
        .snapshot()
        .iter()
        .any(|u| u.user_id == alice));

    let offline = ServerEvent::UserOffline(OnlineUser {
        user_id: alice,
        username: "alice".into(),
    });
    assert_eq!(drain(&mut bob_rx), vec![offline.clone()]);
    assert_eq!(drain(&mut carol_rx), vec![offline]);
}

#[tokio::test]
async fn offline_recipient_reads_message_from_history() {
    let world = World::new();
    let alice = world.register("alice").await;
    let bob = world.register("bob").await;

    let (mut bob_session, _bob_rx) = world
        .gateway
        .connect(Some(&world.access_token(bob).await))
        .unwrap();
    bob_session
        .handle(sphere_core::SessionEvent::Send {
            receiver_id: alice,
            content: "first".into(),
        })
        .await
        .unwrap();
    bob_session
        .handle(sphere_core::SessionEvent::Send {
            receiver_id: alice,
            content: "second".into(),
        })
        .await
        .unwrap();
    assert!(world.gateway.presence().lookup(alice).is_none());

    let (_alice_session, mut alice_rx) = world
        .gateway
        .connect(Some(&world.access_token(alice).await))
        .unwrap();
    // Nothing was queued for her while offline.
    assert!(drain(&mut alice_rx)
        .iter()
        .all(|e| matches!(e, ServerEvent::OnlineUsers(_))));

    let history = world.messages.history(alice, bob).await.unwrap();
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(history.iter().all(|m| m.sender_id == bob && m.receiver_id == alice));
}

#[tokio::test]
async fn message_survives_reconnect() {
    let world = World::new();
    let alice = world.register("alice").await;
    let bob = world.register("bob").await;
    let token = world.access_token(alice).await;

    let (alice_session, _) = world.gateway.connect(Some(&token)).unwrap();
    world.messages.append(bob, alice, "while online").await.unwrap();
    drop(alice_session);

    let (_alice_session, _) = world.gateway.connect(Some(&token)).unwrap();
    let history = world.messages.history(alice, bob).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "while online");
}

#[tokio::test]
async fn follow_notifies_once_and_unfollow_is_silent() {
    let world = World::new();
    let alice = world.register("alice").await;
    let bob = world.register("bob").await;

    let (_bob_session, mut bob_rx) = world
        .gateway
        .connect(Some(&world.access_token(bob).await))
        .unwrap();
    drain(&mut bob_rx);

    let (outcome, notification) = world.engagement.follow(alice, bob).await.unwrap();
    assert_eq!(outcome, FollowOutcome::Followed);
    let notification = notification.unwrap();
    assert_eq!(notification.kind, NotificationKind::Follow);
    assert_eq!(notification.recipient_id, bob);
    assert_eq!(notification.message, "alice started following you.");
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::NewNotification(notification)]
    );

    let (outcome, notification) = world.engagement.follow(alice, bob).await.unwrap();
    assert_eq!(outcome, FollowOutcome::Unfollowed);
    assert!(notification.is_none());
    assert!(drain(&mut bob_rx).is_empty());
    assert_eq!(world.notifications.list(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn self_comment_never_notifies() {
    let world = World::new();
    let alice = world.register("alice").await;
    let bob = world.register("bob").await;

    let notification = world
        .engagement
        .commented(bob, alice, "post-1", "What a great photo, where was this taken?")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.kind, NotificationKind::Comment);
    assert_eq!(notification.recipient_id, alice);
    assert_eq!(notification.related_post_id.as_deref(), Some("post-1"));
    assert!(notification
        .message
        .starts_with("bob commented on your post: What a great photo"));

    assert!(world
        .engagement
        .commented(bob, bob, "post-2", "bumping my own post")
        .await
        .unwrap()
        .is_none());
    assert!(world
        .engagement
        .liked(bob, bob, "post-2")
        .await
        .unwrap()
        .is_none());
    assert!(world.notifications.list(bob).await.unwrap().is_empty());
    assert_eq!(world.notifications.list(alice).await.unwrap().len(), 1);
}

#[tokio::test]
async fn follow_graph_stays_symmetric() {
    let world = World::new();
    let mut ids = Vec::new();
    for name in ["ann", "ben", "cat", "dan"] {
        ids.push(world.register(name).await);
    }

    // A fixed pseudo-random walk of toggles.
    let mut seed: usize = 7;
    for _ in 0..60 {
        seed = (seed * 31 + 11) % 97;
        let a = ids[seed % ids.len()];
        let b = ids[(seed / 4) % ids.len()];
        if a == b {
            continue;
        }
        world.engagement.follow(a, b).await.unwrap();
    }

    for &a in &ids {
        let ia = world.directory.require(a).await.unwrap();
        for &b in &ids {
            let ib = world.directory.require(b).await.unwrap();
            assert_eq!(ia.following.contains(&b), ib.followers.contains(&a));
        }
    }
}

#[tokio::test]
async fn revoked_session_keeps_live_socket_until_expiry() {
    let world = World::new();
    let alice = world.register("alice").await;
    let token = world.access_token(alice).await;

    world.accounts.logout(alice).await.unwrap();
    let (session, _) = world.gateway.connect(Some(&token)).unwrap();
    assert_eq!(session.user_id(), alice);
}

#[tokio::test]
async fn concurrent_connect_disconnect_leaves_no_dangling_entries() {
    let world = World::new();
    let mut users = Vec::new();
    for i in 0..8 {
        let id = world.register(&format!("user{i}")).await;
        users.push((id, world.access_token(id).await));
    }

    let mut tasks = Vec::new();
    for (_, token) in users.clone() {
        let gateway = world.gateway.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let (session, _rx) = gateway.connect(Some(&token)).unwrap();
                tokio::task::yield_now().await;
                drop(session);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(world.gateway.presence().is_empty());
}
