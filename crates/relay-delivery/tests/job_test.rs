//! Integration tests for the broker job state machine.
//!
//! Each test drives single job runs with `run_job` under a `TestClock`, so
//! every phase transition, deferral, and attempt increment is observed
//! without background tasks.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use relay_core::{
    events::{DeferralReason, DeliveryEvent},
    models::{DestinationId, LockKey, MessageId, MessageStatus, OwnerToken, Platform},
};
use relay_delivery::{
    adapter::AdapterRegistry, lock::ChannelLock, DeliveryConfig, DeliveryEngine, JobOutcome,
    SendError, WindowLimit,
};
use relay_testing::{Clock, Invariants, MessageBuilder, ScriptedAdapter, TestEnv};

async fn twitch_env() -> (TestEnv, Arc<ScriptedAdapter>) {
    let env = TestEnv::new();
    env.add_destination(Platform::Twitch, "chan-1").await;
    (env, Arc::new(ScriptedAdapter::new()))
}

fn engine_for(env: &TestEnv, adapter: &Arc<ScriptedAdapter>) -> Result<DeliveryEngine> {
    env.engine_with_adapter(TestEnv::test_config(), Platform::Twitch, adapter.clone())
}

#[tokio::test]
async fn pending_message_is_sent_without_consuming_an_attempt() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let engine = engine_for(&env, &adapter)?;
    let message = env.insert_message(MessageBuilder::new().text("!uptime 3h").build()).await?;

    let outcome = engine.run_job(message.id).await?;

    assert_eq!(outcome, JobOutcome::Completed);
    let row = env.message(message.id).await?;
    assert_eq!(row.status, MessageStatus::Sent);
    assert_eq!(row.attempts, 0);
    assert!(row.sent_at.is_some());

    let sends = adapter.sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].destination, "ext-chan-1");
    assert_eq!(sends[0].text, "!uptime 3h");
    assert_eq!(env.events.sent_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn transient_failure_then_success_ends_sent_with_one_attempt() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    adapter.script_outcomes([Err(SendError::transient("connection reset"))]).await;
    let engine = engine_for(&env, &adapter)?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    let JobOutcome::Requeue(delay) = engine.run_job(message.id).await? else {
        anyhow::bail!("failed send should requeue the job");
    };
    assert!(delay > Duration::ZERO);

    let row = env.message(message.id).await?;
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.as_deref().is_some_and(|e| e.contains("connection reset")));

    env.advance(delay);
    let second = engine.run_job(message.id).await?;
    assert_eq!(second, JobOutcome::Completed);

    let row = env.message(message.id).await?;
    assert_eq!(row.status, MessageStatus::Sent);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error, None);
    assert_eq!(adapter.send_count().await, 2);
    assert_eq!(env.events.retried_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_attempts_dead_letter_the_message() -> Result<()> {
    let env = TestEnv::new();
    env.add_destination(Platform::Twitch, "chan-1").await;
    let adapter = Arc::new(ScriptedAdapter::always_failing("rate limited by platform"));
    let config = DeliveryConfig { max_attempts: 3, ..TestEnv::test_config() };
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    let mut requeues = 0;
    while let JobOutcome::Requeue(delay) = engine.run_job(message.id).await? {
        requeues += 1;
        env.advance(delay);
    }
    assert_eq!(requeues, 2);

    let row = env.message(message.id).await?;
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.attempts, 3);
    assert!(row.failed_at.is_some());
    assert!(row.last_error.as_deref().is_some_and(|e| e.contains("rate limited")));

    let dead_letters = env.store.dead_letters().await;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].message_id, message.id);
    assert_eq!(dead_letters[0].attempts, 3);
    assert_eq!(env.events.dead_lettered_count().await, 1);

    // terminal rows are never touched again
    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    assert_eq!(adapter.send_count().await, 3);
    Invariants::check_all(&env.messages().await, 3)?;
    Ok(())
}

#[tokio::test]
async fn not_ready_destination_defers_without_consuming_attempts() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    adapter.script_readiness([false, false, false]).await;
    let config = TestEnv::test_config();
    let not_ready_delay = config.not_ready_delay;
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    for _ in 0..3 {
        assert_eq!(engine.run_job(message.id).await?, JobOutcome::Requeue(not_ready_delay));
        let row = env.message(message.id).await?;
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.attempts, 0);
    }
    assert_eq!(adapter.send_count().await, 0);

    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    let row = env.message(message.id).await?;
    assert_eq!(row.status, MessageStatus::Sent);
    assert_eq!(row.attempts, 0);
    assert_eq!(env.events.deferred_count(DeferralReason::ChannelNotReady).await, 3);
    assert_eq!(engine.stats().await.deferred, 3);
    Ok(())
}

#[tokio::test]
async fn inactive_destination_is_never_checked() -> Result<()> {
    let env = TestEnv::new();
    let adapter = Arc::new(ScriptedAdapter::new());
    let engine = engine_for(&env, &adapter)?;
    let message = env.insert_message(MessageBuilder::new().destination("offline").build()).await?;

    assert!(matches!(engine.run_job(message.id).await?, JobOutcome::Requeue(_)));
    assert_eq!(adapter.readiness_checks().await, 0);
    assert_eq!(env.message(message.id).await?.status, MessageStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn platform_without_adapter_is_deferred() -> Result<()> {
    let env = TestEnv::new();
    env.add_destination(Platform::Kick, "kick-room").await;
    let adapter = Arc::new(ScriptedAdapter::new());
    let engine = env.engine_with_adapter(TestEnv::test_config(), Platform::Twitch, adapter)?;
    let message = MessageBuilder::new().platform(Platform::Kick).destination("kick-room").build();
    let message = env.insert_message(message).await?;

    assert!(matches!(engine.run_job(message.id).await?, JobOutcome::Requeue(_)));
    assert_eq!(env.events.deferred_count(DeferralReason::ChannelNotReady).await, 1);
    assert_eq!(env.message(message.id).await?.attempts, 0);
    Ok(())
}

#[tokio::test]
async fn held_channel_lock_defers_until_lease_expires() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let config = TestEnv::test_config();
    let lock_retry_delay = config.lock_retry_delay;
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    let chan = DestinationId::new("chan-1");
    let other_worker =
        env.lock.acquire(Platform::Twitch, &chan, OwnerToken::new(), Duration::from_secs(5)).await?;
    assert!(other_worker.acquired);

    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Requeue(lock_retry_delay));
    assert_eq!(adapter.send_count().await, 0);
    assert_eq!(env.message(message.id).await?.status, MessageStatus::Pending);
    assert_eq!(env.events.deferred_count(DeferralReason::LockUnavailable).await, 1);

    env.advance(Duration::from_secs(6));

    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    assert_eq!(env.message(message.id).await?.status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn lock_contention_does_not_spend_throttle_capacity() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let config = DeliveryConfig {
        rate_limit: WindowLimit::new(1, Duration::from_secs(30)),
        ..TestEnv::test_config()
    };
    let lock_retry_delay = config.lock_retry_delay;
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    let chan = DestinationId::new("chan-1");
    let key = LockKey::for_destination(Platform::Twitch, &chan);
    let other_worker = OwnerToken::new();
    let lease =
        env.lock.acquire(Platform::Twitch, &chan, other_worker, Duration::from_secs(5)).await?;
    assert!(lease.acquired);

    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Requeue(lock_retry_delay));
    assert_eq!(env.events.deferred_count(DeferralReason::Throttled).await, 0);

    assert!(env.lock.release(&key, other_worker).await?);
    env.advance(lock_retry_delay);

    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    assert_eq!(adapter.send_count().await, 1);
    assert_eq!(env.message(message.id).await?.status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn one_channel_on_two_platforms_uses_each_platform_adapter() -> Result<()> {
    let env = TestEnv::new();
    env.add_destination(Platform::Twitch, "chan-1").await;
    env.add_destination(Platform::Youtube, "chan-1").await;
    let twitch = Arc::new(ScriptedAdapter::new());
    let youtube = Arc::new(ScriptedAdapter::new());
    let adapters = AdapterRegistry::new()
        .with_adapter(Platform::Twitch, twitch.clone())
        .with_adapter(Platform::Youtube, youtube.clone());
    let engine = env.engine(TestEnv::test_config(), adapters)?;

    let on_twitch = env.insert_message(MessageBuilder::new().text("on twitch").build()).await?;
    let on_youtube = MessageBuilder::new().platform(Platform::Youtube).text("on youtube").build();
    let on_youtube = env.insert_message(on_youtube).await?;

    assert_eq!(engine.run_job(on_youtube.id).await?, JobOutcome::Completed);
    assert_eq!(engine.run_job(on_twitch.id).await?, JobOutcome::Completed);

    let twitch_sends = twitch.sends().await;
    let youtube_sends = youtube.sends().await;
    assert_eq!(twitch_sends.len(), 1);
    assert_eq!(twitch_sends[0].text, "on twitch");
    assert_eq!(youtube_sends.len(), 1);
    assert_eq!(youtube_sends[0].text, "on youtube");
    Ok(())
}

#[tokio::test]
async fn retry_backoff_is_honored_by_another_engine() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    adapter.script_outcomes([Err(SendError::transient("timeout"))]).await;
    let first = engine_for(&env, &adapter)?;
    let second = engine_for(&env, &adapter)?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    let JobOutcome::Requeue(delay) = first.run_job(message.id).await? else {
        anyhow::bail!("failed send should requeue the job");
    };

    assert_eq!(second.recover().await?, 0);
    assert!(matches!(second.run_job(message.id).await?, JobOutcome::Requeue(_)));
    assert_eq!(env.events.deferred_count(DeferralReason::BackoffPending).await, 1);
    assert_eq!(adapter.send_count().await, 1);
    assert_eq!(env.message(message.id).await?.attempts, 1);

    env.advance(delay);

    assert_eq!(second.run_job(message.id).await?, JobOutcome::Completed);
    assert_eq!(adapter.send_count().await, 2);
    assert_eq!(env.message(message.id).await?.status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn channel_lock_is_released_after_every_outcome() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    adapter.script_outcomes([Err(SendError::rejected("message too long"))]).await;
    let engine = env.engine_with_adapter(TestEnv::test_config(), Platform::Twitch, adapter)?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;
    let key = LockKey::for_destination(Platform::Twitch, &DestinationId::new("chan-1"));

    let JobOutcome::Requeue(delay) = engine.run_job(message.id).await? else {
        anyhow::bail!("rejected send should requeue the job");
    };
    assert_eq!(env.lock.holder(&key).await, None);

    env.advance(delay);
    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    assert_eq!(env.lock.holder(&key).await, None);
    Ok(())
}

#[tokio::test]
async fn live_claim_defers_and_stale_claim_is_taken_over() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let config = TestEnv::test_config();
    let processing_retry_delay = config.processing_retry_delay;
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;

    let now = env.clock.now_utc();
    let crashed = MessageBuilder::new().abandoned_claim(now, now, 1);
    env.store.seed(crashed.clone()).await;

    assert_eq!(engine.run_job(crashed.id).await?, JobOutcome::Requeue(processing_retry_delay));
    assert_eq!(env.events.deferred_count(DeferralReason::ClaimInFlight).await, 1);
    assert_eq!(adapter.send_count().await, 0);

    env.advance(Duration::from_secs(61));

    assert_eq!(engine.run_job(crashed.id).await?, JobOutcome::Completed);
    let row = env.message(crashed.id).await?;
    assert_eq!(row.status, MessageStatus::Sent);
    assert_eq!(row.attempts, 1);
    assert_eq!(adapter.send_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn platform_stale_override_applies_to_its_rows() -> Result<()> {
    let env = TestEnv::new();
    env.add_destination(Platform::Youtube, "live-chat").await;
    let adapter = Arc::new(ScriptedAdapter::new());
    let mut config = TestEnv::test_config();
    config.stale_processing_overrides.insert(Platform::Youtube, Duration::from_secs(5));
    let engine = env.engine_with_adapter(config, Platform::Youtube, adapter.clone())?;

    let now = env.clock.now_utc();
    let crashed = MessageBuilder::new()
        .platform(Platform::Youtube)
        .destination("live-chat")
        .abandoned_claim(now, now, 0);
    env.store.seed(crashed.clone()).await;

    env.advance(Duration::from_secs(6));

    assert_eq!(engine.run_job(crashed.id).await?, JobOutcome::Completed);
    assert_eq!(env.message(crashed.id).await?.status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn full_throttle_window_defers_for_the_remaining_window() -> Result<()> {
    let env = TestEnv::new();
    env.add_destination(Platform::Twitch, "chan-1").await;
    env.add_destination(Platform::Twitch, "chan-2").await;
    let adapter = Arc::new(ScriptedAdapter::new());
    let config = DeliveryConfig {
        rate_limit: WindowLimit::new(1, Duration::from_secs(60)),
        ..TestEnv::test_config()
    };
    let engine = env.engine_with_adapter(config, Platform::Twitch, adapter.clone())?;
    let first = env.insert_message(MessageBuilder::new().destination("chan-1").build()).await?;
    let second = env.insert_message(MessageBuilder::new().destination("chan-2").build()).await?;

    assert_eq!(engine.run_job(first.id).await?, JobOutcome::Completed);
    assert_eq!(engine.run_job(second.id).await?, JobOutcome::Requeue(Duration::from_secs(60)));
    assert_eq!(env.message(second.id).await?.attempts, 0);
    assert_eq!(env.events.deferred_count(DeferralReason::Throttled).await, 1);

    env.advance(Duration::from_secs(60));

    assert_eq!(engine.run_job(second.id).await?, JobOutcome::Completed);
    assert_eq!(adapter.send_count().await, 2);
    Ok(())
}

#[tokio::test]
async fn unknown_message_completes_immediately() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let engine = engine_for(&env, &adapter)?;

    assert_eq!(engine.run_job(MessageId::new()).await?, JobOutcome::Completed);
    assert_eq!(adapter.readiness_checks().await, 0);
    Ok(())
}

#[tokio::test]
async fn store_failure_surfaces_as_job_error() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    let engine = engine_for(&env, &adapter)?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;
    env.store.inject_claim_error("connection refused").await;

    assert!(engine.run_job(message.id).await.is_err());
    assert_eq!(adapter.send_count().await, 0);

    // the lock was released, so the next run proceeds normally
    assert_eq!(engine.run_job(message.id).await?, JobOutcome::Completed);
    Ok(())
}

#[tokio::test]
async fn events_follow_the_message_lifecycle() -> Result<()> {
    let (env, adapter) = twitch_env().await;
    adapter.script_readiness([false]).await;
    adapter.script_outcomes([Err(SendError::transient("timeout"))]).await;
    let engine = env.engine_with_adapter(TestEnv::test_config(), Platform::Twitch, adapter)?;
    let message = env.insert_message(MessageBuilder::new().build()).await?;

    while let JobOutcome::Requeue(delay) = engine.run_job(message.id).await? {
        env.advance(delay);
    }

    let kinds: Vec<&str> = env
        .events
        .events_for(message.id)
        .await
        .iter()
        .map(|event| match event {
            DeliveryEvent::Deferred(_) => "deferred",
            DeliveryEvent::Retried(_) => "retried",
            DeliveryEvent::Sent(_) => "sent",
            DeliveryEvent::DeadLettered(_) => "dead_lettered",
        })
        .collect();
    assert_eq!(kinds, ["deferred", "retried", "sent"]);
    Ok(())
}
