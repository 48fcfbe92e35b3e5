//! Integration tests for the Postgres repositories.
//!
//! Runs against the database named by `DATABASE_URL` and returns early when
//! it is not set. Each test works on freshly generated ids so tests can share
//! one database.

use chrono::{Duration, Utc};
use relay_core::{
    models::{
        DeadLetter, DestinationId, DestinationInfo, LockKey, MessageStatus, NewOutboxMessage,
        OwnerToken, Platform,
    },
    storage::Storage,
};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn storage() -> Option<Storage> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.ok()?;
    let storage = Storage::new(pool);
    storage.bootstrap_schema().await.unwrap();
    Some(storage)
}

fn unique_destination() -> DestinationId {
    DestinationId::new(format!("chan-{}", Uuid::new_v4()))
}

#[tokio::test]
async fn claim_single_has_exactly_one_winner() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let message = NewOutboxMessage::new(Platform::Twitch, unique_destination(), "ext", "hello")
        .into_message(now);
    storage.outbox_messages.insert(&message).await.unwrap();

    let stale_before = now - Duration::seconds(60);
    let repo = storage.outbox_messages.clone();
    let contenders = (0..8).map(|_| {
        let repo = repo.clone();
        let id = message.id;
        tokio::spawn(async move { repo.claim_single(id, stale_before, now).await.unwrap() })
    });
    let wins = futures::future::join_all(contenders)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();

    assert_eq!(wins, 1);
    let stored = storage.outbox_messages.find(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Processing);
    assert_eq!(stored.attempts, 0);
}

#[tokio::test]
async fn finalize_is_noop_on_terminal_rows() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let message = NewOutboxMessage::new(Platform::Kick, unique_destination(), "ext", "hello")
        .into_message(now);
    storage.outbox_messages.insert(&message).await.unwrap();

    assert!(storage.outbox_messages.mark_sent(message.id, now).await.unwrap());
    assert!(!storage.outbox_messages.mark_retry(message.id, 1, "late", now).await.unwrap());

    let mut tx = storage.outbox_messages.pool().begin().await.unwrap();
    let failed = storage
        .outbox_messages
        .mark_failed_in_tx(&mut tx, message.id, 3, "late", now)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(failed.is_none());

    let stored = storage.outbox_messages.find(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.attempts, 0);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn claim_batch_respects_destinations_and_staleness() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let ours = unique_destination();
    let theirs = unique_destination();

    let mut ids = Vec::new();
    for offset in 0..3 {
        let message = NewOutboxMessage::new(Platform::Youtube, ours.clone(), "ext", "m")
            .into_message(now - Duration::seconds(10 - offset));
        storage.outbox_messages.insert(&message).await.unwrap();
        ids.push(message.id);
    }
    let other = NewOutboxMessage::new(Platform::Youtube, theirs, "ext", "m").into_message(now);
    storage.outbox_messages.insert(&other).await.unwrap();

    let stale_before = now - Duration::seconds(60);
    let first = storage
        .outbox_messages
        .claim_batch(Platform::Youtube, std::slice::from_ref(&ours), stale_before, now, 2)
        .await
        .unwrap();
    assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..2].to_vec());

    let second = storage
        .outbox_messages
        .claim_batch(Platform::Youtube, std::slice::from_ref(&ours), stale_before, now, 10)
        .await
        .unwrap();
    assert_eq!(second.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2]]);

    let later = now + Duration::seconds(120);
    let later_stale = later - Duration::seconds(60);
    let reclaimed = storage
        .outbox_messages
        .claim_batch(Platform::Youtube, std::slice::from_ref(&ours), later_stale, later, 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 3);
}

#[tokio::test]
async fn claim_batch_is_scoped_to_one_platform() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let shared = unique_destination();

    let twitch = NewOutboxMessage::new(Platform::Twitch, shared.clone(), "tw", "m")
        .into_message(now - Duration::seconds(5));
    let youtube =
        NewOutboxMessage::new(Platform::Youtube, shared.clone(), "yt", "m").into_message(now);
    storage.outbox_messages.insert(&twitch).await.unwrap();
    storage.outbox_messages.insert(&youtube).await.unwrap();

    let claimed = storage
        .outbox_messages
        .claim_batch(Platform::Youtube, &[shared], now - Duration::seconds(60), now, 10)
        .await
        .unwrap();
    assert_eq!(claimed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![youtube.id]);
    let untouched = storage.outbox_messages.find(twitch.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, MessageStatus::Pending);
}

#[tokio::test]
async fn retry_backoff_is_persisted_and_honored_by_claims() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let destination = unique_destination();
    let repo = &storage.outbox_messages;

    let head = NewOutboxMessage::new(Platform::Kick, destination.clone(), "ext", "first")
        .into_message(now - Duration::seconds(2));
    let tail = NewOutboxMessage::new(Platform::Kick, destination.clone(), "ext", "second")
        .into_message(now - Duration::seconds(1));
    repo.insert(&head).await.unwrap();
    repo.insert(&tail).await.unwrap();

    let retry_at = now + Duration::seconds(30);
    assert!(repo.mark_retry(head.id, 1, "timeout", retry_at).await.unwrap());
    let stored = repo.find(head.id).await.unwrap().unwrap();
    assert_eq!(stored.next_attempt_at.map(|at| at.timestamp()), Some(retry_at.timestamp()));

    let stale_before = now - Duration::seconds(60);
    assert!(!repo.claim_single(head.id, stale_before, now).await.unwrap());
    assert!(!repo.list_claimable(stale_before, now, 1_000).await.unwrap().contains(&head.id));

    // the head is held back, so its destination yields nothing
    let held = repo
        .claim_batch(Platform::Kick, std::slice::from_ref(&destination), stale_before, now, 10)
        .await
        .unwrap();
    assert!(held.is_empty());

    let due = retry_at + Duration::seconds(1);
    let claimed = repo
        .claim_batch(Platform::Kick, &[destination], due - Duration::seconds(60), due, 10)
        .await
        .unwrap();
    assert_eq!(claimed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![head.id, tail.id]);
}

#[tokio::test]
async fn channel_lock_lease_semantics() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let key = LockKey::for_destination(Platform::Trovo, &unique_destination());
    let first = OwnerToken::new();
    let second = OwnerToken::new();
    let locks = &storage.channel_locks;

    assert!(locks.try_acquire(&key, first, now, now + Duration::seconds(15)).await.unwrap());
    assert!(!locks.try_acquire(&key, second, now, now + Duration::seconds(15)).await.unwrap());
    assert!(!locks.release(&key, second).await.unwrap());

    let after_expiry = now + Duration::seconds(16);
    assert!(locks
        .try_acquire(&key, second, after_expiry, after_expiry + Duration::seconds(15))
        .await
        .unwrap());
    assert!(!locks.release(&key, first).await.unwrap());
    assert!(locks.release(&key, second).await.unwrap());
    assert!(locks.holder(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn dead_letters_and_destinations_round_trip() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let destination = DestinationInfo {
        internal_id: unique_destination(),
        platform: Platform::Vkvideo,
        external_id: "vk-1".to_string(),
    };
    storage.destinations.upsert(&destination, true, now).await.unwrap();
    let active = storage.destinations.list_active().await.unwrap();
    assert!(active.contains(&destination));

    storage.destinations.upsert(&destination, false, now).await.unwrap();
    let active = storage.destinations.list_active().await.unwrap();
    assert!(!active.contains(&destination));

    let message = NewOutboxMessage::new(
        destination.platform,
        destination.internal_id.clone(),
        "vk-1",
        "bye",
    )
    .into_message(now);
    storage.outbox_messages.insert(&message).await.unwrap();

    let mut tx = storage.outbox_messages.pool().begin().await.unwrap();
    let failed = storage
        .outbox_messages
        .mark_failed_in_tx(&mut tx, message.id, 3, "boom", now)
        .await
        .unwrap()
        .unwrap();
    let dead_letter = DeadLetter {
        message_id: failed.id,
        platform: failed.platform,
        internal_destination_id: failed.internal_destination_id.clone(),
        attempts: failed.attempts,
        last_error: failed.last_error.clone(),
        failed_at: now,
    };
    storage.dead_letters.insert_in_tx(&mut tx, &dead_letter).await.unwrap();
    tx.commit().await.unwrap();

    let stored = storage.dead_letters.find(message.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn one_channel_can_be_mapped_on_several_platforms() {
    let Some(storage) = storage().await else { return };
    let now = Utc::now();
    let internal_id = unique_destination();
    let twitch = DestinationInfo {
        internal_id: internal_id.clone(),
        platform: Platform::Twitch,
        external_id: "tw-1".to_string(),
    };
    let youtube = DestinationInfo {
        internal_id,
        platform: Platform::Youtube,
        external_id: "yt-1".to_string(),
    };

    storage.destinations.upsert(&twitch, true, now).await.unwrap();
    storage.destinations.upsert(&youtube, true, now).await.unwrap();

    let active = storage.destinations.list_active().await.unwrap();
    assert!(active.contains(&twitch));
    assert!(active.contains(&youtube));
}
