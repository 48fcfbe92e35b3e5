//! Test infrastructure for the outbox relay.
//!
//! Wires the in-memory store, lock and directory to a controllable clock so
//! delivery scenarios run without a database. Provides fixture builders, a
//! scripted send adapter, an event recorder, and invariant checks.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use relay_core::models::{
    DestinationInfo, MessageId, MessageStatus, NewOutboxMessage, OutboxMessage, Platform,
};
use relay_delivery::{
    adapter::{AdapterRegistry, StaticDestinationDirectory},
    lock::InMemoryChannelLock,
    store::{memory::InMemoryOutboxStore, OutboxStore},
    BackoffPolicy, DeliveryConfig, DeliveryEngine, EngineComponents, WindowLimit,
};

pub mod adapter;
pub mod events;
pub mod fixtures;
pub mod invariants;

pub use adapter::{ScriptedAdapter, SendCall};
pub use events::RecordingEventHandler;
pub use fixtures::{destination, external_id_for, MessageBuilder};
pub use invariants::{strategies, Invariants};
pub use relay_core::{Clock, RealClock, TestClock};

/// In-memory delivery environment.
///
/// Every component reads time from the same clock. Environments built with
/// [`TestEnv::new`] use a [`TestClock`] that only moves when the test
/// advances it; [`TestEnv::realtime`] uses wall-clock time for tests that run
/// the engine's background loops.
pub struct TestEnv {
    /// Deterministic clock, shared with every component unless realtime.
    pub clock: TestClock,
    /// Outbox rows
    pub store: Arc<InMemoryOutboxStore>,
    /// Channel lock table
    pub lock: Arc<InMemoryChannelLock>,
    /// Active destinations
    pub directory: Arc<StaticDestinationDirectory>,
    /// Every event emitted by engines built from this environment
    pub events: Arc<RecordingEventHandler>,
    clock_handle: Arc<dyn Clock>,
}

impl TestEnv {
    /// Creates an environment driven by a [`TestClock`].
    pub fn new() -> Self {
        let clock = TestClock::new();
        let handle: Arc<dyn Clock> = Arc::new(clock.clone());
        Self::with_clock(clock, handle)
    }

    /// Creates an environment driven by the real clock.
    pub fn realtime() -> Self {
        Self::with_clock(TestClock::new(), Arc::new(RealClock::new()))
    }

    fn with_clock(clock: TestClock, clock_handle: Arc<dyn Clock>) -> Self {
        init_tracing();
        Self {
            clock,
            store: Arc::new(InMemoryOutboxStore::new(clock_handle.clone())),
            lock: Arc::new(InMemoryChannelLock::new(clock_handle.clone())),
            directory: Arc::new(StaticDestinationDirectory::new(clock_handle.clone())),
            events: Arc::new(RecordingEventHandler::new()),
            clock_handle,
        }
    }

    /// Clock every component of this environment uses.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        self.clock_handle.clone()
    }

    /// Marks a destination active and returns its record.
    pub async fn add_destination(&self, platform: Platform, id: &str) -> DestinationInfo {
        let info = fixtures::destination(platform, id);
        self.directory.upsert(info.clone()).await;
        info
    }

    /// Configuration with short delays and a generous rate limit.
    pub fn test_config() -> DeliveryConfig {
        DeliveryConfig {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(20),
            lock_ttl: Duration::from_secs(5),
            lock_retry_delay: Duration::from_millis(10),
            processing_retry_delay: Duration::from_millis(10),
            not_ready_delay: Duration::from_millis(10),
            rate_limit: WindowLimit::new(1_000, Duration::from_secs(1)),
            backoff: BackoffPolicy::new(Duration::from_millis(10), 1.0),
            broker_failure_delay: Duration::from_millis(10),
            recovery_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        }
    }

    /// Components backed by this environment's in-memory state.
    pub fn components(&self, adapters: AdapterRegistry) -> EngineComponents {
        EngineComponents {
            store: self.store.clone(),
            lock: self.lock.clone(),
            directory: self.directory.clone(),
            adapters,
        }
    }

    /// Builds an engine over this environment that reports to
    /// [`TestEnv::events`].
    pub fn engine(
        &self,
        config: DeliveryConfig,
        adapters: AdapterRegistry,
    ) -> Result<DeliveryEngine> {
        DeliveryEngine::with_event_handler(
            config,
            self.components(adapters),
            self.clock_handle.clone(),
            self.events.clone(),
        )
        .context("failed to build delivery engine")
    }

    /// Builds an engine with a single scripted adapter for `platform`.
    pub fn engine_with_adapter(
        &self,
        config: DeliveryConfig,
        platform: Platform,
        adapter: Arc<ScriptedAdapter>,
    ) -> Result<DeliveryEngine> {
        let mut adapters = AdapterRegistry::new();
        adapters.register(platform, adapter);
        self.engine(config, adapters)
    }

    /// Inserts a pending message directly into the store.
    pub async fn insert_message(&self, message: NewOutboxMessage) -> Result<OutboxMessage> {
        self.store.insert(message).await.context("failed to insert outbox message")
    }

    /// Reads a message that must exist.
    pub async fn message(&self, id: MessageId) -> Result<OutboxMessage> {
        self.store
            .find(id)
            .await
            .context("failed to read outbox message")?
            .with_context(|| format!("outbox message {id} not found"))
    }

    /// Every row in the store, oldest first.
    pub async fn messages(&self) -> Vec<OutboxMessage> {
        self.store.all_messages().await
    }

    /// Advances the test clock.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Waits, in real time, until a message reaches `status`.
    pub async fn wait_for_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        timeout: Duration,
    ) -> Result<OutboxMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = self.message(id).await?;
            if message.status == status {
                return Ok(message);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "message {id} still {} with {} attempts after {timeout:?}, expected {status}",
                    message.status,
                    message.attempts
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs a test-writer subscriber once. Honors `RUST_LOG`, defaults to
/// errors only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}
