use super::*;

use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

fn alice() -> ParticipantId {
    ParticipantId::from("alice")
}

fn bob() -> ParticipantId {
    ParticipantId::from("bob")
}

fn alice_bob() -> ConversationKey {
    ConversationKey::new(alice(), bob())
}

async fn memory_store() -> MessageStore {
    MessageStore::new("sqlite::memory:").await.expect("db")
}

async fn next_snapshot(subscription: &mut Subscription) -> Vec<Message> {
    timeout(Duration::from_secs(2), subscription.next_snapshot())
        .await
        .expect("snapshot within timeout")
        .expect("subscription open")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = memory_store().await;
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("messages.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = MessageStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn insert_assigns_increasing_ids() {
    let store = memory_store().await;
    let first = store
        .insert(NewMessage::outbound(alice(), bob(), "one", 100))
        .await
        .expect("first");
    let second = store
        .insert(NewMessage::outbound(alice(), bob(), "two", 100))
        .await
        .expect("second");
    assert!(first.id.0 > 0);
    assert!(second.id > first.id);
    assert_eq!(first.conversation_key, alice_bob());
    assert_eq!(first.direction, Direction::Outbound);
    assert_eq!(first.delivery, DeliveryState::Pending);
    assert_eq!(first.label, None);
}

#[tokio::test]
async fn query_orders_by_timestamp_then_id() {
    let store = memory_store().await;
    let late = store
        .insert(NewMessage::inbound(bob(), alice(), "late", 300))
        .await
        .expect("late");
    let early = store
        .insert(NewMessage::outbound(alice(), bob(), "early", 100))
        .await
        .expect("early");
    let tie_a = store
        .insert(NewMessage::outbound(alice(), bob(), "tie-a", 200))
        .await
        .expect("tie a");
    let tie_b = store
        .insert(NewMessage::inbound(bob(), alice(), "tie-b", 200))
        .await
        .expect("tie b");

    let ids: Vec<_> = store
        .query(&alice_bob())
        .await
        .expect("query")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![early.id, tie_a.id, tie_b.id, late.id]);
}

#[tokio::test]
async fn concurrent_inserts_stay_partitioned_by_conversation() {
    let store = memory_store().await;
    let peers = ["bob", "carol", "dave"];

    let mut tasks = Vec::new();
    for peer in peers {
        for n in 0..10_i64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .insert(NewMessage::outbound(
                        alice(),
                        ParticipantId::from(peer),
                        format!("{peer}-{n}"),
                        1_000 - n,
                    ))
                    .await
                    .expect("insert")
            }));
        }
    }
    for task in tasks {
        task.await.expect("join");
    }

    for peer in peers {
        let key = ConversationKey::new(alice(), ParticipantId::from(peer));
        let messages = store.query(&key).await.expect("query");
        assert_eq!(messages.len(), 10);
        assert!(messages.iter().all(|m| m.conversation_key == key));
        assert!(messages
            .windows(2)
            .all(|w| (w[0].timestamp_ms, w[0].id) < (w[1].timestamp_ms, w[1].id)));
    }
    assert_eq!(lock_entries(&store), 0, "idle conversation locks are pruned");
}

fn lock_entries(store: &MessageStore) -> usize {
    store
        .key_locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len()
}

#[tokio::test]
async fn conversation_locks_are_released_after_every_mutation() {
    let store = memory_store().await;
    let stored = store
        .insert(NewMessage::outbound(alice(), bob(), "one", 100))
        .await
        .expect("insert");
    assert_eq!(lock_entries(&store), 0);

    store
        .insert_unless_duplicate(
            NewMessage::inbound(ParticipantId::from("carol"), alice(), "hey", 200),
            Duration::from_secs(3),
        )
        .await
        .expect("insert");
    store
        .update_label(stored.id, Some("work"))
        .await
        .expect("label");
    store.mark_delivered(stored.id).await.expect("delivered");
    let _subscription = store.subscribe(&alice_bob()).await.expect("subscribe");
    assert_eq!(lock_entries(&store), 0);

    // A writer queued behind the holder keeps the entry alive until it finishes.
    let guard = store.lock_key(&alice_bob()).await;
    let queued = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .insert(NewMessage::outbound(alice(), bob(), "two", 300))
                .await
                .expect("queued insert")
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(guard);
    assert_eq!(lock_entries(&store), 1);
    queued.await.expect("join");
    assert_eq!(lock_entries(&store), 0);
    assert_eq!(store.query(&alice_bob()).await.expect("query").len(), 2);
}

#[tokio::test]
async fn label_round_trip_restores_no_label() {
    let store = memory_store().await;
    let message = store
        .insert(NewMessage::outbound(alice(), bob(), "https://example.com", 1))
        .await
        .expect("insert");

    let labeled = store
        .update_label(message.id, Some("x"))
        .await
        .expect("label");
    assert_eq!(labeled.label.as_deref(), Some("x"));

    let cleared = store
        .update_label(message.id, Some(""))
        .await
        .expect("clear");
    assert_eq!(cleared.label, None);

    let reloaded = store.get(message.id).await.expect("get").expect("exists");
    assert_eq!(reloaded, Message { label: None, ..labeled });
}

#[tokio::test]
async fn update_label_on_unknown_id_is_not_found() {
    let store = memory_store().await;
    let err = store
        .update_label(MessageId(4242), Some("work"))
        .await
        .expect_err("unknown id");
    assert!(matches!(err, StoreError::NotFound(4242)));
}

#[tokio::test]
async fn mark_delivered_flips_pending_once() {
    let store = memory_store().await;
    let message = store
        .insert(NewMessage::outbound(alice(), bob(), "queued", 5))
        .await
        .expect("insert");
    assert_eq!(store.pending_outbound(&alice()).await.expect("pending").len(), 1);

    let delivered = store.mark_delivered(message.id).await.expect("deliver");
    assert_eq!(delivered.delivery, DeliveryState::Delivered);
    assert!(store.pending_outbound(&alice()).await.expect("pending").is_empty());

    let again = store.mark_delivered(message.id).await.expect("idempotent");
    assert_eq!(again.delivery, DeliveryState::Delivered);

    let err = store
        .mark_delivered(MessageId(999))
        .await
        .expect_err("unknown id");
    assert!(matches!(err, StoreError::NotFound(999)));
}

#[tokio::test]
async fn pending_outbound_is_oldest_first_and_scoped_to_sender() {
    let store = memory_store().await;
    let newer = store
        .insert(NewMessage::outbound(alice(), bob(), "newer", 20))
        .await
        .expect("newer");
    let older = store
        .insert(NewMessage::outbound(alice(), "carol".into(), "older", 10))
        .await
        .expect("older");
    store
        .insert(NewMessage::outbound(bob(), alice(), "bob pending", 15))
        .await
        .expect("other sender");

    let pending: Vec<_> = store
        .pending_outbound(&alice())
        .await
        .expect("pending")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(pending, vec![older.id, newer.id]);
}

#[tokio::test]
async fn duplicate_detection_respects_window_and_participants() {
    let store = memory_store().await;
    store
        .insert(NewMessage::inbound(bob(), alice(), "hi", 1_000))
        .await
        .expect("insert");
    let key = alice_bob();
    let window = Duration::from_millis(500);

    assert!(store
        .exists_duplicate(&key, &bob(), "hi", 1_400, window)
        .await
        .expect("within window"));
    assert!(!store
        .exists_duplicate(&key, &bob(), "hi", 1_600, window)
        .await
        .expect("outside window"));
    assert!(!store
        .exists_duplicate(&key, &alice(), "hi", 1_000, window)
        .await
        .expect("other sender"));
    assert!(!store
        .exists_duplicate(&key, &bob(), "hi there", 1_000, window)
        .await
        .expect("other content"));
    assert!(!store
        .exists_duplicate(&key, &"mallory".into(), "hi", 1_000, window)
        .await
        .expect("sender outside conversation"));
}

#[tokio::test]
async fn insert_unless_duplicate_stores_once() {
    let store = memory_store().await;
    let window = Duration::from_secs(3);

    let first = store
        .insert_unless_duplicate(NewMessage::inbound(bob(), alice(), "hi", 101), window)
        .await
        .expect("first");
    assert!(matches!(first, InsertOutcome::Inserted(_)));

    let second = store
        .insert_unless_duplicate(NewMessage::inbound(bob(), alice(), "hi", 102), window)
        .await
        .expect("second");
    assert_eq!(second, InsertOutcome::Duplicate);

    assert_eq!(store.query(&alice_bob()).await.expect("query").len(), 1);
}

#[tokio::test]
async fn subscribe_emits_current_state_then_every_mutation() {
    let store = memory_store().await;
    let existing = store
        .insert(NewMessage::outbound(alice(), bob(), "hello", 100))
        .await
        .expect("insert");

    let mut subscription = store.subscribe(&alice_bob()).await.expect("subscribe");
    let initial = next_snapshot(&mut subscription).await;
    assert_eq!(initial, vec![existing.clone()]);

    let reply = store
        .insert(NewMessage::inbound(bob(), alice(), "hi", 101))
        .await
        .expect("reply");
    let after_insert = next_snapshot(&mut subscription).await;
    assert_eq!(after_insert.len(), 2);
    assert_eq!(after_insert[1].id, reply.id);

    store
        .update_label(existing.id, Some("greeting"))
        .await
        .expect("label");
    let after_label = next_snapshot(&mut subscription).await;
    assert_eq!(after_label[0].label.as_deref(), Some("greeting"));
}

#[tokio::test]
async fn every_subscriber_of_a_key_is_notified_and_other_keys_are_not() {
    let store = memory_store().await;
    let carol_key = ConversationKey::new(alice(), "carol".into());

    let mut first = store.subscribe(&alice_bob()).await.expect("first");
    let mut second = store.subscribe(&alice_bob()).await.expect("second");
    let mut unrelated = store.subscribe(&carol_key).await.expect("unrelated");
    assert_eq!(store.subscriber_count(&alice_bob()), 2);

    assert!(next_snapshot(&mut first).await.is_empty());
    assert!(next_snapshot(&mut second).await.is_empty());
    assert!(next_snapshot(&mut unrelated).await.is_empty());

    store
        .insert(NewMessage::outbound(alice(), bob(), "ping", 1))
        .await
        .expect("insert");

    assert_eq!(next_snapshot(&mut first).await.len(), 1);
    assert_eq!(next_snapshot(&mut second).await.len(), 1);
    assert!(
        timeout(Duration::from_millis(100), unrelated.next_snapshot())
            .await
            .is_err(),
        "subscriber of another conversation must not be notified"
    );
}

#[tokio::test]
async fn unsubscribe_stops_emissions_and_releases_registration() {
    let store = memory_store().await;
    let mut subscription = store.subscribe(&alice_bob()).await.expect("subscribe");
    next_snapshot(&mut subscription).await;

    store
        .insert(NewMessage::outbound(alice(), bob(), "in flight", 1))
        .await
        .expect("insert");
    subscription.unsubscribe();
    assert!(!subscription.is_active());
    assert_eq!(store.subscriber_count(&alice_bob()), 0);

    store
        .insert(NewMessage::outbound(alice(), bob(), "after", 2))
        .await
        .expect("insert after unsubscribe");
    assert!(subscription.next_snapshot().await.is_none());
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn dropping_a_subscription_unregisters_it() {
    let store = memory_store().await;
    {
        let _subscription = store.subscribe(&alice_bob()).await.expect("subscribe");
        assert_eq!(store.subscriber_count(&alice_bob()), 1);
    }
    assert_eq!(store.subscriber_count(&alice_bob()), 0);
}

#[tokio::test]
async fn subscription_is_a_stream() {
    let store = memory_store().await;
    let mut subscription = store.subscribe(&alice_bob()).await.expect("subscribe");
    let first = timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("timely")
        .expect("open");
    assert!(first.is_empty());
}

#[tokio::test]
async fn conversation_partners_are_most_recent_first() {
    let store = memory_store().await;
    store
        .insert(NewMessage::outbound(alice(), bob(), "old", 10))
        .await
        .expect("bob");
    store
        .insert(NewMessage::inbound("carol".into(), alice(), "new", 50))
        .await
        .expect("carol");
    store
        .insert(NewMessage::outbound("dave".into(), "erin".into(), "unrelated", 60))
        .await
        .expect("unrelated");

    let partners = store.conversation_partners(&alice()).await.expect("partners");
    assert_eq!(partners, vec![ParticipantId::from("carol"), bob()]);
}

#[test]
fn sqlite_path_ignores_memory_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/messages.db?mode=rwc"),
        Some(PathBuf::from("./data/messages.db"))
    );
}
