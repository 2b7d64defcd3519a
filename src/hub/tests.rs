use std::{sync::Arc, thread};

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use super::*;
use crate::{
    db::{memory_pool, User},
    protocol::MembershipAction,
};

async fn setup() -> (Hub, SqlitePool) {
    let db_pool = memory_pool().await;
    let hub = Hub::new(MessageStore::new(db_pool.clone()), Arc::new(PresenceRegistry::new()));
    (hub, db_pool)
}

async fn user(hub: &Hub, name: &str) -> User {
    hub.store().create_user(name, Some(format!("/avatars/{name}.png").as_str())).await.unwrap()
}

fn online(hub: &Hub, user: UserId) -> (ConnectionId, mpsc::Receiver<Push>) {
    let (conn, rx) = Connection::open(256);
    let conn_id = conn.id;
    hub.connect(user, conn);
    (conn_id, rx)
}

fn drain(rx: &mut mpsc::Receiver<Push>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push((*event).clone());
    }
    events
}

fn messages(rx: &mut mpsc::Receiver<Push>) -> Vec<String> {
    drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::ReceiveMessage { content, .. } => Some(content),
            _ => None,
        })
        .collect()
}

fn status_changes(events: &[ServerEvent], user: UserId) -> (usize, usize) {
    events.iter().fold((0, 0), |(on, off), event| match event {
        ServerEvent::UserStatusChanged { user_id, is_online: true } if *user_id == user => (on + 1, off),
        ServerEvent::UserStatusChanged { user_id, is_online: false } if *user_id == user => (on, off + 1),
        _ => (on, off),
    })
}

fn last_status(events: &[ServerEvent], user: UserId) -> Option<bool> {
    events.iter().rev().find_map(|event| match event {
        ServerEvent::UserStatusChanged { user_id, is_online } if *user_id == user => Some(*is_online),
        _ => None,
    })
}

fn text(content: &str) -> SendMessage {
    SendMessage {
        content: content.to_owned(),
        ..Default::default()
    }
}

#[tokio::test]
async fn presence_is_announced_once_per_transition() {
    let (hub, _db) = setup().await;
    let (_, mut watcher) = online(&hub, 100);

    let (a, _rx_a) = online(&hub, 1);
    let (b, _rx_b) = online(&hub, 1);
    hub.disconnect(a);
    hub.disconnect(a);
    hub.disconnect(b);

    let events = drain(&mut watcher);
    assert_eq!(status_changes(&events, 1), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_and_disconnects_announce_once() {
    let (hub, _db) = setup().await;
    let (_, mut watcher) = online(&hub, 100);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let (conn, rx) = Connection::open(256);
            let conn_id = conn.id;
            hub.connect(7, conn);
            (conn_id, rx)
        }));
    }
    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap());
    }
    assert!(hub.presence().is_online(7));

    let mut tasks = Vec::new();
    for (conn_id, _) in &conns {
        for _ in 0..2 {
            let hub = hub.clone();
            let conn_id = *conn_id;
            tasks.push(tokio::spawn(async move { hub.disconnect(conn_id) }));
        }
    }
    let lasts = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|outcome| outcome.as_ref().unwrap().is_last())
        .count();

    assert_eq!(lasts, 1);
    assert_eq!(status_changes(&drain(&mut watcher), 7), (1, 1));
}

#[tokio::test]
async fn observers_are_left_with_the_actual_presence() {
    let (hub, _db) = setup().await;
    let (watcher, mut rx) = Connection::open(4096);
    hub.connect(100, watcher);

    for _ in 0..50 {
        // odd threads keep their connection, even ones drop it right away
        let kept: Vec<(ConnectionId, mpsc::Receiver<Push>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let hub = &hub;
                    s.spawn(move || {
                        let (conn, conn_rx) = Connection::open(64);
                        let conn_id = conn.id;
                        hub.connect(9, conn);
                        if i % 2 == 0 {
                            hub.disconnect(conn_id);
                            None
                        } else {
                            Some((conn_id, conn_rx))
                        }
                    })
                })
                .collect();
            handles.into_iter().filter_map(|handle| handle.join().unwrap()).collect()
        });
        assert!(hub.presence().is_online(9));
        assert_eq!(last_status(&drain(&mut rx), 9), Some(true));

        thread::scope(|s| {
            for (conn_id, _) in &kept {
                let hub = &hub;
                s.spawn(move || hub.disconnect(*conn_id));
            }
        });
        assert!(!hub.presence().is_online(9));
        assert_eq!(last_status(&drain(&mut rx), 9), Some(false));
    }
}

#[tokio::test]
async fn group_message_reaches_every_member_connection_once() {
    let (hub, _db) = setup().await;
    let (a, b, c, d) = (
        user(&hub, "a").await,
        user(&hub, "b").await,
        user(&hub, "c").await,
        user(&hub, "d").await,
    );
    let group = hub.store().create_group(a.id, "abc", None, &[b.id, c.id]).await.unwrap();

    let (_, mut a1) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    let (_, mut c1) = online(&hub, c.id);
    let (_, mut c2) = online(&hub, c.id);
    let (_, mut d1) = online(&hub, d.id);
    for rx in [&mut a1, &mut b1, &mut c1, &mut c2, &mut d1] {
        drain(rx);
    }

    let sent = hub
        .send_message(
            b.id,
            SendMessage {
                group_id: Some(group.id),
                ..text("hello group")
            },
        )
        .await
        .unwrap();
    assert_eq!(sent.group_id, Some(group.id));

    for rx in [&mut a1, &mut b1, &mut c1, &mut c2] {
        assert_eq!(messages(rx), ["hello group"]);
    }
    assert!(messages(&mut d1).is_empty());
}

#[tokio::test]
async fn group_fan_out_follows_current_membership() {
    let (hub, _db) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let group = hub.store().create_group(a.id, "g", None, &[b.id]).await.unwrap();
    let (_, mut b1) = online(&hub, b.id);
    drain(&mut b1);

    hub.store().remove_member(group.id, b.id).await.unwrap();
    hub.send_message(a.id, SendMessage { group_id: Some(group.id), ..text("after leave") })
        .await
        .unwrap();

    assert!(messages(&mut b1).is_empty());
}

#[tokio::test]
async fn private_message_reaches_only_the_pair() {
    let (hub, _db) = setup().await;
    let (a, b, c) = (user(&hub, "a").await, user(&hub, "b").await, user(&hub, "c").await);

    let (_, mut a1) = online(&hub, a.id);
    let (_, mut a2) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    let (_, mut c1) = online(&hub, c.id);
    for rx in [&mut a1, &mut a2, &mut b1, &mut c1] {
        drain(rx);
    }

    hub.send_message(a.id, SendMessage { receiver_id: Some(b.id), ..text("psst") })
        .await
        .unwrap();

    for rx in [&mut a1, &mut a2, &mut b1] {
        assert_eq!(messages(rx), ["psst"]);
    }
    assert!(messages(&mut c1).is_empty());
}

#[tokio::test]
async fn note_to_self_is_delivered_once_per_connection() {
    let (hub, _db) = setup().await;
    let a = user(&hub, "a").await;
    let (_, mut a1) = online(&hub, a.id);
    drain(&mut a1);

    hub.send_message(a.id, SendMessage { receiver_id: Some(a.id), ..text("memo") })
        .await
        .unwrap();
    assert_eq!(messages(&mut a1), ["memo"]);
}

#[tokio::test]
async fn global_message_reaches_everyone_online() {
    let (hub, _db) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let (_, mut a1) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    drain(&mut a1);

    hub.send_message(a.id, text("hi all")).await.unwrap();

    let events = drain(&mut b1);
    let payload = events
        .iter()
        .find(|event| matches!(event, ServerEvent::ReceiveMessage { .. }))
        .unwrap();
    let ServerEvent::ReceiveMessage {
        sender_id,
        sender_display_name,
        sender_avatar_ref,
        receiver_id,
        group_id,
        id,
        ..
    } = payload
    else {
        unreachable!()
    };
    assert_eq!(*sender_id, a.id);
    assert_eq!(sender_display_name, "a");
    assert_eq!(sender_avatar_ref.as_deref(), Some("/avatars/a.png"));
    assert_eq!((*receiver_id, *group_id), (None, None));
    assert!(*id > 0);
    assert_eq!(messages(&mut a1), ["hi all"]);
}

#[tokio::test]
async fn display_name_comes_from_the_user_record() {
    let (hub, _db) = setup().await;
    let a = user(&hub, "alice").await;
    let (_, mut a1) = online(&hub, a.id);
    drain(&mut a1);

    hub.send_message(
        a.id,
        SendMessage {
            display_name: "admin".to_owned(),
            ..text("trust me")
        },
    )
    .await
    .unwrap();

    let names: Vec<String> = drain(&mut a1)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::ReceiveMessage { sender_display_name, .. } => Some(sender_display_name),
            _ => None,
        })
        .collect();
    assert_eq!(names, ["alice"]);
}

#[tokio::test]
async fn invalid_messages_are_rejected_before_storage() {
    let (hub, _db) = setup().await;
    let a = user(&hub, "a").await;
    let group = hub.store().create_group(a.id, "g", None, &[]).await.unwrap();

    let cases = [
        text(""),
        SendMessage { image_ref: Some(" ".to_owned()), ..text("  ") },
        SendMessage { receiver_id: Some(a.id), group_id: Some(group.id), ..text("both") },
        SendMessage { receiver_id: Some(999), ..text("nobody") },
        SendMessage { group_id: Some(999), ..text("nowhere") },
    ];
    for case in cases {
        assert!(matches!(
            hub.send_message(a.id, case).await,
            Err(ChatError::InvalidMessage(_))
        ));
    }
    assert!(hub.store().history(a.id, Scope::Global, None).await.unwrap().is_empty());

    let image_only = hub
        .send_message(a.id, SendMessage { image_ref: Some("/uploads/x.png".to_owned()), ..text("") })
        .await
        .unwrap();
    assert_eq!(image_only.content, "");
}

#[tokio::test]
async fn unknown_sender_is_not_persisted() {
    let (hub, _db) = setup().await;
    let a = user(&hub, "a").await;
    let (_, mut a1) = online(&hub, a.id);
    drain(&mut a1);

    assert!(matches!(
        hub.send_message(404, text("ghost")).await,
        Err(ChatError::SenderNotFound(404))
    ));
    assert!(hub.store().history(a.id, Scope::Global, None).await.unwrap().is_empty());
    assert!(messages(&mut a1).is_empty());
}

#[tokio::test]
async fn storage_failure_delivers_nothing() {
    let (hub, db_pool) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let group = hub.store().create_group(a.id, "g", None, &[b.id]).await.unwrap();
    let (_, mut a1) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    drain(&mut a1);
    drain(&mut b1);

    sqlx::query("DROP TABLE messages").execute(&db_pool).await.unwrap();

    for request in [
        text("global"),
        SendMessage { receiver_id: Some(b.id), ..text("private") },
        SendMessage { group_id: Some(group.id), ..text("group") },
    ] {
        assert!(matches!(
            hub.send_message(a.id, request).await,
            Err(ChatError::StorageFailure(_))
        ));
    }
    assert!(drain(&mut a1).is_empty());
    assert!(drain(&mut b1).is_empty());
}

#[tokio::test]
async fn offline_member_catches_up_from_history() {
    let (hub, _db) = setup().await;
    let (a, b, c) = (user(&hub, "a").await, user(&hub, "b").await, user(&hub, "c").await);
    let group = hub.store().create_group(a.id, "g", None, &[b.id, c.id]).await.unwrap();
    let to_group = |content: &str| SendMessage { group_id: Some(group.id), ..text(content) };

    let (c_conn, mut c1) = online(&hub, c.id);
    hub.send_message(a.id, to_group("first")).await.unwrap();
    hub.disconnect(c_conn);
    assert_eq!(messages(&mut c1), ["first"]);

    hub.send_message(b.id, to_group("while away")).await.unwrap();
    hub.send_message(a.id, to_group("still away")).await.unwrap();
    assert!(c1.try_recv().is_err());

    let (_, mut c2) = online(&hub, c.id);
    hub.send_message(a.id, to_group("welcome back")).await.unwrap();
    assert_eq!(messages(&mut c2), ["welcome back"]);

    let history: Vec<String> = hub
        .store()
        .history(c.id, Scope::Group(group.id), None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, ["first", "while away", "still away", "welcome back"]);
}

#[tokio::test]
async fn send_survives_sender_disconnect() {
    let (hub, _db) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let (a_conn, _a1) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    drain(&mut b1);

    let send = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.send_message(a.id, SendMessage { receiver_id: Some(b.id), ..text("bye") }).await })
    };
    hub.disconnect(a_conn);

    send.await.unwrap().unwrap();
    assert!(messages(&mut b1).contains(&"bye".to_owned()));
    assert_eq!(hub.store().history(b.id, Scope::Private(a.id), None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stalled_connection_is_dropped_and_announced() {
    let (hub, _db) = setup().await;
    let (slow, rx_slow) = Connection::open(1);
    let slow_id = slow.id;
    // its own online event fills the queue
    hub.connect(50, slow);
    let (_, mut watcher) = online(&hub, 60);

    assert!(!hub.presence().is_online(50));
    assert_eq!(hub.presence().connection(slow_id).map(|c| c.id), None);
    assert_eq!(status_changes(&drain(&mut watcher), 50), (0, 1));
    drop(rx_slow);
}

#[tokio::test]
async fn closed_connection_does_not_affect_other_recipients() {
    let (hub, _db) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let (_, mut a1) = online(&hub, a.id);
    let (b_dead, rx_dead) = online(&hub, b.id);
    let (_, mut b2) = online(&hub, b.id);
    drop(rx_dead);
    drain(&mut a1);
    drain(&mut b2);

    hub.send_message(a.id, SendMessage { receiver_id: Some(b.id), ..text("still here") })
        .await
        .unwrap();

    assert_eq!(messages(&mut a1), ["still here"]);
    assert_eq!(messages(&mut b2), ["still here"]);
    assert!(hub.presence().connection(b_dead).is_none());
    assert!(hub.presence().is_online(b.id));
}

#[tokio::test]
async fn channel_join_is_announced_to_the_channel() {
    let (hub, _db) = setup().await;
    let (a, b) = (user(&hub, "a").await, user(&hub, "b").await);
    let (a_conn, mut a1) = online(&hub, a.id);
    let (b_conn, mut b1) = online(&hub, b.id);
    drain(&mut a1);
    drain(&mut b1);

    hub.join_channel(a_conn, a.id, "lobby").await.unwrap();
    assert_eq!(messages(&mut a1), ["a joined lobby"]);
    assert!(messages(&mut b1).is_empty());

    hub.join_channel(b_conn, b.id, "lobby").await.unwrap();
    assert_eq!(messages(&mut a1), ["b joined lobby"]);
    assert_eq!(messages(&mut b1), ["b joined lobby"]);

    assert!(matches!(
        hub.join_channel(a_conn, a.id, " ").await,
        Err(ChatError::InvalidMessage(_))
    ));
}

#[tokio::test]
async fn membership_changes_reach_the_given_members() {
    let (hub, _db) = setup().await;
    let (a, b, c) = (user(&hub, "a").await, user(&hub, "b").await, user(&hub, "c").await);
    let group = hub.store().create_group(a.id, "g", None, &[b.id]).await.unwrap();
    let (_, mut a1) = online(&hub, a.id);
    let (_, mut b1) = online(&hub, b.id);
    let (_, mut c1) = online(&hub, c.id);
    for rx in [&mut a1, &mut b1, &mut c1] {
        drain(rx);
    }

    let before = hub.store().members(group.id).await.unwrap();
    hub.notify_membership(MembershipAction::Removed, &group, &before);

    for rx in [&mut a1, &mut b1] {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::GroupMembershipChanged { action: MembershipAction::Removed, group: summary }
                if summary.id == group.id && summary.owner_id == a.id
        ));
    }
    assert!(drain(&mut c1).is_empty());
}

#[tokio::test]
async fn reply_goes_to_the_caller_only() {
    let (hub, _db) = setup().await;
    let (a_conn, mut a1) = online(&hub, 1);
    let (_, mut a2) = online(&hub, 1);
    drain(&mut a1);
    drain(&mut a2);

    hub.reply(a_conn, ServerEvent::system("nope"));
    assert_eq!(messages(&mut a1), ["nope"]);
    assert!(drain(&mut a2).is_empty());
}
