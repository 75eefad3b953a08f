//! End-to-end exercises of the chat core: rooms, pipeline, receipts,
//! reactions, unread counts, and the catch-up path, driven through the
//! dispatcher exactly the way the gateway drives them.

use std::sync::Arc;

use uuid::Uuid;

use notehub_chat::Chat;
use notehub_db::Database;
use notehub_types::error::ChatError;
use notehub_types::events::ServerEvent;
use notehub_types::models::MessageView;

fn chat() -> Arc<Chat> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Chat::new(db, "test-room-secret")
}

async fn connect(
    chat: &Chat,
    user: Uuid,
    room: Uuid,
) -> (Uuid, tokio::sync::mpsc::Receiver<ServerEvent>) {
    let (session, rx) = chat.dispatch.register(user).await;
    chat.subscribe(session, user, room).await.unwrap();
    (session, rx)
}

fn expect_message_new(event: ServerEvent) -> MessageView {
    match event {
        ServerEvent::MessageNew { message } => message,
        other => panic!("expected message.new, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_a_send_deliver_read() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    let (_s1, mut alice_rx) = connect(&chat, alice, room.id).await;
    let (_s2, mut bob_rx) = connect(&chat, bob, room.id).await;

    // A sends "hi".
    let sent = chat
        .pipeline
        .send_message(room.id, alice, "c1", "hi")
        .await
        .unwrap();

    // B (online) receives message.new with the plaintext body.
    let received = expect_message_new(bob_rx.recv().await.unwrap());
    assert_eq!(received.id, sent.id);
    assert_eq!(received.body, "hi");
    assert_eq!(received.seq, 1);
    // Sender echo.
    expect_message_new(alice_rx.recv().await.unwrap());

    // B acks -> A sees message.delivered.
    chat.pipeline.ack_delivery(sent.id, bob).await.unwrap();
    match alice_rx.recv().await.unwrap() {
        ServerEvent::MessageDelivered { message_id, user_id } => {
            assert_eq!(message_id, sent.id);
            assert_eq!(user_id, bob);
        }
        other => panic!("expected message.delivered, got {:?}", other),
    }

    // B marks read -> A sees one message.read summary, B's unread is 0.
    chat.pipeline.mark_read(bob, room.id, sent.id).await.unwrap();
    match alice_rx.recv().await.unwrap() {
        ServerEvent::MessageRead {
            room_id,
            user_id,
            upto_message_id,
        } => {
            assert_eq!(room_id, room.id);
            assert_eq!(user_id, bob);
            assert_eq!(upto_message_id, sent.id);
        }
        other => panic!("expected message.read, got {:?}", other),
    }
    assert_eq!(chat.unread.get(room.id, bob).await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_b_offline_catch_up_pull() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    // A is offline while B sends three messages.
    for (cmid, body) in [("c1", "one"), ("c2", "two"), ("c3", "three")] {
        chat.pipeline
            .send_message(room.id, bob, cmid, body)
            .await
            .unwrap();
    }

    // A reconnects and pulls everything after its last known seq (0).
    let missed = chat.pipeline.catch_up(room.id, alice, 0, 50).await.unwrap();
    let bodies: Vec<&str> = missed.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["one", "two", "three"]);
    let seqs: Vec<i64> = missed.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, [1, 2, 3]);

    assert_eq!(chat.unread.get(room.id, alice).await.unwrap(), 3);

    // The cursor excludes what was already seen.
    let rest = chat.pipeline.catch_up(room.id, alice, 2, 50).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].body, "three");
}

#[tokio::test]
async fn scenario_c_outsider_sees_nothing() {
    let chat = chat();
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], false, None)
        .await
        .unwrap();

    // Subscribe is refused outright.
    let (session, mut mallory_rx) = chat.dispatch.register(mallory).await;
    assert!(matches!(
        chat.subscribe(session, mallory, room.id).await,
        Err(ChatError::Forbidden { .. })
    ));

    // Room traffic and typing produce nothing for the outsider.
    chat.pipeline
        .send_message(room.id, alice, "c1", "private")
        .await
        .unwrap();
    chat.presence.start_typing(room.id, alice).await.unwrap();
    assert!(mallory_rx.try_recv().is_err());

    // Nor can the outsider act on the room.
    assert!(matches!(
        chat.pipeline.send_message(room.id, mallory, "c9", "hi").await,
        Err(ChatError::Forbidden { .. })
    ));
    assert!(matches!(
        chat.presence.start_typing(room.id, mallory).await,
        Err(ChatError::Forbidden { .. })
    ));
}

#[tokio::test]
async fn scenario_d_encryption_is_fixed_at_creation() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let plain = chat
        .rooms
        .create_room(&[alice, bob], false, None)
        .await
        .unwrap();
    let encrypted = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    let p = chat
        .pipeline
        .send_message(plain.id, alice, "c1", "plain body")
        .await
        .unwrap();
    let e = chat
        .pipeline
        .send_message(encrypted.id, alice, "c1", "secret body")
        .await
        .unwrap();

    // Plain room: stored exactly as sent, no nonce.
    let row = chat.db.get_message(&p.id.to_string()).unwrap().unwrap();
    assert_eq!(row.body, b"plain body");
    assert!(row.nonce.is_none());

    // Encrypted room: ciphertext never equals the plaintext.
    let row = chat.db.get_message(&e.id.to_string()).unwrap().unwrap();
    assert_ne!(row.body, b"secret body");
    assert!(row.nonce.is_some());

    // And it still reads back as plaintext through the pipeline.
    let views = chat
        .pipeline
        .catch_up(encrypted.id, bob, 0, 10)
        .await
        .unwrap();
    assert_eq!(views[0].body, "secret body");
}

#[tokio::test]
async fn send_replay_does_not_create_a_second_row() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    let first = chat
        .pipeline
        .send_message(room.id, alice, "retry-1", "hello")
        .await
        .unwrap();
    let replay = chat
        .pipeline
        .send_message(room.id, alice, "retry-1", "hello")
        .await
        .unwrap();

    assert_eq!(first.id, replay.id);
    assert_eq!(first.seq, replay.seq);
    assert_eq!(replay.body, "hello");

    let all = chat.pipeline.catch_up(room.id, bob, 0, 50).await.unwrap();
    assert_eq!(all.len(), 1);
    // Unread reflects one message, not two.
    assert_eq!(chat.unread.reconcile(room.id, bob).await.unwrap(), 1);
}

#[tokio::test]
async fn mark_read_twice_equals_once() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], false, None)
        .await
        .unwrap();

    chat.pipeline
        .send_message(room.id, alice, "c1", "a")
        .await
        .unwrap();
    let last = chat
        .pipeline
        .send_message(room.id, alice, "c2", "b")
        .await
        .unwrap();

    chat.pipeline.mark_read(bob, room.id, last.id).await.unwrap();
    let once = chat.unread.reconcile(room.id, bob).await.unwrap();

    chat.pipeline.mark_read(bob, room.id, last.id).await.unwrap();
    let twice = chat.unread.reconcile(room.id, bob).await.unwrap();

    assert_eq!(once, 0);
    assert_eq!(once, twice);
}

#[tokio::test]
async fn reaction_toggled_twice_restores_original_set() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], false, None)
        .await
        .unwrap();
    let msg = chat
        .pipeline
        .send_message(room.id, alice, "c1", "react to me")
        .await
        .unwrap();

    let baseline = chat
        .pipeline
        .toggle_reaction(msg.id, alice, "🎉")
        .await
        .unwrap();
    assert_eq!(baseline.len(), 1);

    let after_add = chat
        .pipeline
        .toggle_reaction(msg.id, bob, "👍")
        .await
        .unwrap();
    assert_eq!(after_add.len(), 2);

    let after_remove = chat
        .pipeline
        .toggle_reaction(msg.id, bob, "👍")
        .await
        .unwrap();
    assert_eq!(after_remove.len(), 1);
    assert_eq!(after_remove[0].emoji, "🎉");
}

#[tokio::test]
async fn fanout_order_matches_sequence_order() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    let (_session, mut bob_rx) = connect(&chat, bob, room.id).await;

    for i in 0..5 {
        let sender = if i % 2 == 0 { alice } else { bob };
        chat.pipeline
            .send_message(room.id, sender, &format!("c{i}"), &format!("m{i}"))
            .await
            .unwrap();
    }

    let mut last_seq = 0;
    for _ in 0..5 {
        let view = expect_message_new(bob_rx.recv().await.unwrap());
        assert_eq!(view.seq, last_seq + 1, "fan-out must follow sequence order");
        last_seq = view.seq;
    }
}

#[tokio::test]
async fn pin_and_unpin_broadcast_and_survive_catch_up() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], false, None)
        .await
        .unwrap();
    let msg = chat
        .pipeline
        .send_message(room.id, alice, "c1", "pin me")
        .await
        .unwrap();

    let (_session, mut bob_rx) = connect(&chat, bob, room.id).await;

    chat.pipeline.pin(msg.id, bob).await.unwrap();
    match bob_rx.recv().await.unwrap() {
        ServerEvent::MessagePinned {
            message_id,
            pinned_by,
        } => {
            assert_eq!(message_id, msg.id);
            assert_eq!(pinned_by, bob);
        }
        other => panic!("expected message.pinned, got {:?}", other),
    }

    let views = chat.pipeline.catch_up(room.id, bob, 0, 10).await.unwrap();
    assert!(views[0].is_pinned);
    assert_eq!(views[0].pinned_by, Some(bob));

    chat.pipeline.unpin(msg.id, alice).await.unwrap();
    match bob_rx.recv().await.unwrap() {
        ServerEvent::MessageUnpinned { message_id } => assert_eq!(message_id, msg.id),
        other => panic!("expected message.unpinned, got {:?}", other),
    }
}

#[tokio::test]
async fn tampered_row_is_withheld_from_catch_up() {
    let chat = chat();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let room = chat
        .rooms
        .create_room(&[alice, bob], true, None)
        .await
        .unwrap();

    let intact = chat
        .pipeline
        .send_message(room.id, alice, "c1", "intact")
        .await
        .unwrap();
    let doomed = chat
        .pipeline
        .send_message(room.id, alice, "c2", "doomed")
        .await
        .unwrap();

    // Corrupt the stored ciphertext underneath the pipeline.
    chat.db
        .with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET body = X'DEADBEEF' WHERE id = ?1",
                [doomed.id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

    // The tampered message is withheld, never served as garbage; the
    // intact one still comes through.
    let views = chat.pipeline.catch_up(room.id, bob, 0, 10).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].id, intact.id);
    assert_eq!(views[0].body, "intact");
}
