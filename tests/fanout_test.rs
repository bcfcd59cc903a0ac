//! Integration tests for message persistence, broadcast and push fan-out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::harness;
use slotkeeper::core::{CoordError, Message, NewMessage, PushDecision};
use slotkeeper::util::clock::Clock;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn drain(inbox: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut seen = Vec::new();
    while let Ok(message) = inbox.try_recv() {
        seen.push(message);
    }
    seen
}

#[tokio::test]
async fn both_participants_receive_messages_in_order() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let listing = Some(Uuid::new_v4());
    let mut alice_inbox = h.hub.subscribe(alice);
    let mut bob_inbox = h.hub.subscribe(bob);

    for (i, (from, to)) in [(alice, bob), (bob, alice), (alice, bob)].into_iter().enumerate() {
        let report = h
            .coordinator
            .deliver_message(NewMessage::text(from, to, listing, format!("m{i}")))
            .await
            .unwrap();
        assert!(report.broadcast_sender);
        assert!(report.broadcast_receiver);
    }

    let alice_seen: Vec<_> = drain(&mut alice_inbox).iter().map(|m| m.id).collect();
    let bob_seen: Vec<_> = drain(&mut bob_inbox).iter().map(|m| m.id).collect();
    assert_eq!(alice_seen.len(), 3);
    assert_eq!(alice_seen, bob_seen);

    let stored: Vec<_> = h
        .coordinator
        .conversation(bob, alice, listing)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(stored, alice_seen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_are_observed_in_one_order() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut alice_inbox = h.hub.subscribe(alice);
    let mut bob_inbox = h.hub.subscribe(bob);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let coordinator = Arc::clone(&h.coordinator);
            let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
            tokio::spawn(async move {
                coordinator
                    .deliver_message(NewMessage::text(from, to, None, format!("m{i}")))
                    .await
            })
        })
        .collect();
    for joined in futures::future::join_all(handles).await {
        joined.expect("task panicked").unwrap();
    }

    let alice_seen = drain(&mut alice_inbox);
    let bob_seen = drain(&mut bob_inbox);
    assert_eq!(alice_seen.len(), 20);
    assert_eq!(
        alice_seen.iter().map(|m| m.id).collect::<Vec<_>>(),
        bob_seen.iter().map(|m| m.id).collect::<Vec<_>>()
    );
    assert!(alice_seen
        .windows(2)
        .all(|pair| pair[0].ordering_key() < pair[1].ordering_key()));
}

#[tokio::test]
async fn failed_persist_broadcasts_nothing() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut bob_inbox = h.hub.subscribe(bob);
    h.store.set_available(false);

    let err = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::StoreUnavailable(_)));
    assert!(bob_inbox.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_failure_still_delivers() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.hub.set_failing(true);

    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "offline hub"))
        .await
        .unwrap();
    assert!(!report.broadcast_sender);
    assert!(!report.broadcast_receiver);

    let stored = h.coordinator.conversation(alice, bob, None).await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn push_goes_to_active_devices() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.coordinator.register_device(bob, "bob-phone").await.unwrap();
    h.coordinator.register_device(bob, "bob-tablet").await.unwrap();

    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "ping"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::Dispatched { tokens: 2 });

    assert!(eventually(|| h.push.sent().len() == 2).await);
    let sent = h.push.sent();
    assert!(sent.iter().all(|(token, note)| token.user_id == bob && note.body == "ping"));
}

#[tokio::test]
async fn receiver_without_devices_gets_no_push() {
    let h = harness();
    let report = h
        .coordinator
        .deliver_message(NewMessage::text(Uuid::new_v4(), Uuid::new_v4(), None, "hi"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::NoDevices);
}

#[tokio::test]
async fn mute_suppresses_push_until_expiry() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.coordinator.register_device(bob, "bob-phone").await.unwrap();

    let until = h.clock.now_utc() + ChronoDuration::hours(1);
    h.coordinator.mute(bob, alice, None, Some(until)).await.unwrap();
    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "muted"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::Muted);

    h.clock.advance(ChronoDuration::hours(2));
    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "audible"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::Dispatched { tokens: 1 });
}

#[tokio::test]
async fn resource_scoped_mute_only_covers_that_resource() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (muted_listing, other_listing) = (Uuid::new_v4(), Uuid::new_v4());
    h.coordinator.register_device(bob, "bob-phone").await.unwrap();
    h.coordinator
        .mute(bob, alice, Some(muted_listing), None)
        .await
        .unwrap();

    let muted = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, Some(muted_listing), "a"))
        .await
        .unwrap();
    let audible = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, Some(other_listing), "b"))
        .await
        .unwrap();
    assert_eq!(muted.push, PushDecision::Muted);
    assert_eq!(audible.push, PushDecision::Dispatched { tokens: 1 });

    h.coordinator.unmute(bob, alice, Some(muted_listing)).await.unwrap();
    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, Some(muted_listing), "c"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::Dispatched { tokens: 1 });
}

#[tokio::test]
async fn invalid_tokens_are_deactivated() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.coordinator.register_device(bob, "stale").await.unwrap();
    h.coordinator.register_device(bob, "fresh").await.unwrap();
    h.push.reject_token("stale");

    h.coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "hello"))
        .await
        .unwrap();

    assert!(eventually(|| !h.store.token_active("stale")).await);
    assert!(h.store.token_active("fresh"));

    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "again"))
        .await
        .unwrap();
    assert_eq!(report.push, PushDecision::Dispatched { tokens: 1 });
}

#[tokio::test]
async fn new_message_unhides_the_conversation_for_the_receiver() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.coordinator.hide_conversation(bob, alice, None).await.unwrap();
    assert!(h.store.is_hidden(bob, alice, None));

    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "back again"))
        .await
        .unwrap();
    assert!(report.unhidden);
    assert!(!h.store.is_hidden(bob, alice, None));
}

#[tokio::test]
async fn only_the_sender_can_delete_a_message() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let report = h
        .coordinator
        .deliver_message(NewMessage::text(alice, bob, None, "oops"))
        .await
        .unwrap();
    let id = report.message.id;

    let err = h.coordinator.delete_message(id, bob).await.unwrap_err();
    assert!(matches!(err, CoordError::NotFound(_)));

    h.coordinator.delete_message(id, alice).await.unwrap();
    assert!(h.coordinator.conversation(alice, bob, None).await.unwrap().is_empty());
    assert!(matches!(
        h.coordinator.delete_message(id, alice).await,
        Err(CoordError::NotFound(_))
    ));
}

#[tokio::test]
async fn mark_read_counts_only_incoming_messages() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    for body in ["one", "two"] {
        h.coordinator
            .deliver_message(NewMessage::text(alice, bob, None, body))
            .await
            .unwrap();
    }
    h.coordinator
        .deliver_message(NewMessage::text(bob, alice, None, "reply"))
        .await
        .unwrap();

    assert_eq!(h.coordinator.mark_read(bob, alice, None).await.unwrap(), 2);
    assert_eq!(h.coordinator.mark_read(bob, alice, None).await.unwrap(), 0);

    let thread = h.coordinator.conversation(alice, bob, None).await.unwrap();
    let unread: Vec<_> = thread.iter().filter(|m| !m.is_read).collect();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].sender_id, bob);
}
