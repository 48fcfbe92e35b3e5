//! Property tests for outbox message lifecycle rules.
//!
//! Exercises claimability and terminal-state rules over generated rows
//! without a database.

use chrono::{Duration, TimeZone, Utc};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use relay_core::models::{
    DestinationId, LockKey, MessageStatus, NewOutboxMessage, OutboxMessage, Platform,
};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() }
}

fn platform_strategy() -> impl Strategy<Value = Platform> {
    prop::sample::select(Platform::ALL.to_vec())
}

fn status_strategy() -> impl Strategy<Value = MessageStatus> {
    prop::sample::select(vec![
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Sent,
        MessageStatus::Failed,
    ])
}

fn message_with(status: MessageStatus, claimed_secs_ago: i64) -> OutboxMessage {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    let mut message = NewOutboxMessage::new(Platform::Twitch, "chan", "ext", "hi")
        .into_message(now - Duration::hours(1));
    message.status = status;
    if status == MessageStatus::Processing {
        message.processing_at = Some(now - Duration::seconds(claimed_secs_ago));
    }
    message
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn terminal_rows_are_never_claimable(
        status in status_strategy(),
        claimed_secs_ago in 0i64..10_000,
        stale_secs in 1i64..600,
    ) {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let message = message_with(status, claimed_secs_ago);
        let claimable = message.is_claimable(now - Duration::seconds(stale_secs));

        if status.is_terminal() {
            prop_assert!(!claimable);
        }
        if status == MessageStatus::Pending {
            prop_assert!(claimable);
        }
    }

    #[test]
    fn processing_rows_reclaimable_exactly_when_stale(
        claimed_secs_ago in 0i64..10_000,
        stale_secs in 1i64..600,
    ) {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let message = message_with(MessageStatus::Processing, claimed_secs_ago);
        let stale_before = now - Duration::seconds(stale_secs);

        prop_assert_eq!(message.is_claimable(stale_before), claimed_secs_ago > stale_secs);
        prop_assert_eq!(message.is_claim_live(stale_before), claimed_secs_ago <= stale_secs);
    }

    #[test]
    fn lock_keys_distinguish_platforms(
        first in platform_strategy(),
        second in platform_strategy(),
        id in "[a-z0-9]{1,12}",
    ) {
        let destination = DestinationId::new(id.clone());
        let a = LockKey::for_destination(first, &destination);
        let b = LockKey::for_destination(second, &destination);

        prop_assert_eq!(a == b, first == second);
        let expected_suffix = format!(":{id}");
        prop_assert!(a.as_str().ends_with(&expected_suffix));
    }
}

#[test]
fn platform_names_round_trip() {
    for platform in Platform::ALL {
        assert_eq!(platform.to_string().parse::<Platform>(), Ok(platform));
    }
    assert!("myspace".parse::<Platform>().is_err());
}

#[test]
fn message_serializes_status_in_snake_case() {
    let message = message_with(MessageStatus::Processing, 5);
    let json = serde_json::to_value(&message).unwrap();

    assert_eq!(json["status"], "processing");
    assert_eq!(json["platform"], "twitch");
}
