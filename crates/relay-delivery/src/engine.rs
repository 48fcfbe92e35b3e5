//! Outbox delivery engine.
//!
//! The engine owns the delivery context and one of two execution strategies:
//!
//! ```text
//!                       broker_enabled = true
//! ┌────────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │ DeliveryEngine │──▶│ JobBroker  │──▶│ BrokerJob │──▶│ ChannelLock  │
//! └────────────────┘   └────────────┘   └───────────┘   │ SendThrottle │
//!        │   ▲               ▲                          └──────────────┘
//!        │   └── recovery ───┘
//!        │              broker_enabled = false
//!        │             ┌────────────┐
//!        └────────────▶│   Poller   │
//!                      └────────────┘
//!                            │
//!                            ▼
//!          OutboxStore ◀── send_and_finalize ──▶ PlatformSendAdapter
//! ```
//!
//! Both strategies share the store, adapters, backoff policy, stats, and
//! event handler, and finalize rows through the same code path. Broker mode
//! runs a recovery sweep at start and then periodically to pick up rows whose
//! jobs were lost to a restart or abandoned after internal failures.

use std::{collections::HashMap, sync::Arc, time::Duration};

use relay_core::{
    models::{MessageId, NewOutboxMessage, OutboxMessage, Platform},
    Clock, EventHandler, NoOpEventHandler,
};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{AdapterRegistry, DestinationDirectory},
    backoff::BackoffPolicy,
    broker::{BrokerConfig, JobBroker, JobOutcome},
    error::{DeliveryError, Result},
    job::BrokerJob,
    lock::ChannelLock,
    poller::{Poller, TickReport},
    store::OutboxStore,
    throttle::{SendThrottle, WindowLimit},
    worker::DeliveryContext,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Run broker-driven jobs. When false the poll loop is used instead.
    pub broker_enabled: bool,

    /// Job handlers running at once in broker mode.
    pub worker_concurrency: usize,

    /// Destination queues drained at once within a poll tick.
    pub poll_concurrency: usize,

    /// Maximum rows claimed per poll tick.
    pub batch_size: usize,

    /// Interval between poll ticks.
    pub poll_interval: Duration,

    /// Attempts after which a message is dead-lettered.
    pub max_attempts: u32,

    /// Age after which a processing claim counts as abandoned.
    pub stale_processing: Duration,

    /// Per-platform stale thresholds overriding `stale_processing`.
    pub stale_processing_overrides: HashMap<Platform, Duration>,

    /// Channel lock lease length.
    pub lock_ttl: Duration,

    /// Requeue delay when the channel lock is held elsewhere.
    pub lock_retry_delay: Duration,

    /// Requeue delay when the row is under a live claim.
    pub processing_retry_delay: Duration,

    /// Requeue delay when the destination is not ready.
    pub not_ready_delay: Duration,

    /// Global send throttle.
    pub rate_limit: WindowLimit,

    /// Optional per-destination send throttle.
    pub per_destination_rate_limit: Option<WindowLimit>,

    /// Retry backoff.
    pub backoff: BackoffPolicy,

    /// Delay before re-running a job whose handler hit an internal error.
    pub broker_failure_delay: Duration,

    /// Consecutive internal failures after which a job is abandoned.
    pub broker_max_failures: u32,

    /// Interval between recovery sweeps in broker mode.
    pub recovery_interval: Duration,

    /// Maximum rows scheduled per recovery sweep.
    pub recovery_batch_size: usize,

    /// Shutdown timeout - maximum time to wait for in-flight work.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            broker_enabled: true,
            worker_concurrency: crate::DEFAULT_WORKER_CONCURRENCY,
            poll_concurrency: 1,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            stale_processing: crate::DEFAULT_STALE_PROCESSING,
            stale_processing_overrides: HashMap::new(),
            lock_ttl: Duration::from_secs(15),
            lock_retry_delay: Duration::from_secs(1),
            processing_retry_delay: Duration::from_secs(5),
            not_ready_delay: Duration::from_secs(5),
            rate_limit: WindowLimit::new(20, Duration::from_secs(30)),
            per_destination_rate_limit: None,
            backoff: BackoffPolicy::default(),
            broker_failure_delay: Duration::from_secs(5),
            broker_max_failures: 5,
            recovery_interval: Duration::from_secs(30),
            recovery_batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Stale-claim threshold for a platform.
    pub fn stale_threshold(&self, platform: Platform) -> Duration {
        self.stale_processing_overrides.get(&platform).copied().unwrap_or(self.stale_processing)
    }

    /// Shortest stale threshold across all platforms.
    pub fn shortest_stale_threshold(&self) -> Duration {
        self.stale_processing_overrides
            .values()
            .copied()
            .fold(self.stale_processing, Duration::min)
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(DeliveryError::configuration("worker_concurrency must be positive"));
        }
        if self.poll_concurrency == 0 {
            return Err(DeliveryError::configuration("poll_concurrency must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be positive"));
        }
        if self.lock_ttl.is_zero() {
            return Err(DeliveryError::configuration("lock_ttl must be positive"));
        }
        if self.broker_max_failures == 0 {
            return Err(DeliveryError::configuration("broker_max_failures must be at least 1"));
        }
        if self.recovery_batch_size == 0 {
            return Err(DeliveryError::configuration("recovery_batch_size must be positive"));
        }
        if !self.backoff.jitter_factor.is_finite() || self.backoff.jitter_factor < 0.0 {
            return Err(DeliveryError::configuration(
                "backoff jitter_factor must be a non-negative number",
            ));
        }

        validate_limit("rate_limit", self.rate_limit)?;
        if let Some(limit) = self.per_destination_rate_limit {
            validate_limit("per_destination_rate_limit", limit)?;
        }

        let thresholds = std::iter::once(self.stale_processing)
            .chain(self.stale_processing_overrides.values().copied());
        for threshold in thresholds {
            if threshold.is_zero() || chrono::Duration::from_std(threshold).is_err() {
                return Err(DeliveryError::configuration(format!(
                    "stale processing threshold {threshold:?} out of range"
                )));
            }
        }

        Ok(())
    }
}

fn validate_limit(name: &str, limit: WindowLimit) -> Result<()> {
    if limit.max == 0 || limit.window.is_zero() {
        return Err(DeliveryError::configuration(format!(
            "{name} needs a positive max and window"
        )));
    }
    Ok(())
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Messages finalized as sent.
    pub sent: u64,
    /// Failed attempts that left attempts remaining.
    pub retried: u64,
    /// Messages finalized as failed.
    pub failed: u64,
    /// Evaluations postponed without an attempt.
    pub deferred: u64,
    /// Claims lost to another worker.
    pub claim_conflicts: u64,
    /// Job handler runs that hit an internal error.
    pub broker_failures: u64,
    /// Jobs given up after repeated internal errors.
    pub abandoned_jobs: u64,
    /// Sends currently awaiting the platform.
    pub in_flight_sends: u64,
    /// Sum of enqueue-to-claim latency over delivered messages.
    pub queue_latency_total: Duration,
    /// Delivered messages contributing to the latency sum.
    pub queue_latency_samples: u64,
    /// Largest enqueue-to-claim latency observed.
    pub queue_latency_max: Duration,
}

impl EngineStats {
    pub(crate) fn record_queue_latency(&mut self, latency: Duration) {
        self.queue_latency_total = self.queue_latency_total.saturating_add(latency);
        self.queue_latency_samples += 1;
        self.queue_latency_max = self.queue_latency_max.max(latency);
    }

    /// Mean enqueue-to-claim latency of delivered messages.
    pub fn average_queue_latency(&self) -> Option<Duration> {
        let samples = u32::try_from(self.queue_latency_samples).ok().filter(|n| *n > 0)?;
        Some(self.queue_latency_total / samples)
    }
}

/// Collaborators the engine delivers through.
#[derive(Clone)]
pub struct EngineComponents {
    /// Outbox rows.
    pub store: Arc<dyn OutboxStore>,
    /// Per-destination mutual exclusion for broker jobs.
    pub lock: Arc<dyn ChannelLock>,
    /// Active destination view.
    pub directory: Arc<dyn DestinationDirectory>,
    /// Send adapters by platform.
    pub adapters: AdapterRegistry,
}

/// Main delivery engine coordinating broker jobs or the poll loop.
pub struct DeliveryEngine {
    ctx: Arc<DeliveryContext>,
    job: Arc<BrokerJob>,
    poller: Arc<Poller>,
    broker: Option<JobBroker>,
    background: Vec<JoinHandle<()>>,
    started: bool,
}

impl DeliveryEngine {
    /// Creates an engine that reports events nowhere.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(
        config: DeliveryConfig,
        components: EngineComponents,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_event_handler(config, components, clock, Arc::new(NoOpEventHandler::new()))
    }

    /// Creates an engine reporting delivery events to `event_handler`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_event_handler(
        config: DeliveryConfig,
        components: EngineComponents,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let mut throttle = SendThrottle::new(config.rate_limit, clock.clone());
        if let Some(limit) = config.per_destination_rate_limit {
            throttle = throttle.with_per_destination(limit);
        }
        let cancellation_token = CancellationToken::new();

        let ctx = Arc::new(DeliveryContext {
            config,
            store: components.store,
            lock: components.lock,
            throttle,
            adapters: components.adapters,
            directory: components.directory,
            event_handler,
            clock: clock.clone(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: cancellation_token.clone(),
        });

        let job = Arc::new(BrokerJob::new(ctx.clone()));
        let poller = Arc::new(Poller::new(ctx.clone()));
        let broker = ctx.config.broker_enabled.then(|| {
            JobBroker::new(
                BrokerConfig {
                    concurrency: ctx.config.worker_concurrency,
                    failure_delay: ctx.config.broker_failure_delay,
                    max_failures: ctx.config.broker_max_failures,
                },
                job.clone(),
                clock,
                cancellation_token,
            )
        });

        Ok(Self { ctx, job, poller, broker, background: Vec::new(), started: false })
    }

    /// Writes a new pending message and, when running in broker mode,
    /// schedules its job immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the insert.
    pub async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage> {
        let message = self.ctx.store.insert(message).await?;
        debug!(
            message_id = %message.id,
            platform = %message.platform,
            destination = %message.internal_destination_id,
            "message enqueued"
        );

        if self.started {
            if let Some(broker) = &self.broker {
                broker.schedule(message.id, Duration::ZERO).await;
            }
        }
        Ok(message)
    }

    /// Starts background delivery.
    ///
    /// Broker mode spawns the recovery loop, whose first sweep schedules
    /// every claimable row. Poll mode spawns the poll loop. Returns
    /// immediately; use `shutdown()` to stop.
    ///
    /// # Errors
    ///
    /// Returns error if the engine was already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DeliveryError::internal("delivery engine already started"));
        }

        match &self.broker {
            Some(broker) => {
                info!(
                    worker_concurrency = self.ctx.config.worker_concurrency,
                    rate_limit_max = self.ctx.config.rate_limit.max,
                    rate_limit_window_ms = self.ctx.config.rate_limit.window.as_millis(),
                    "starting outbox delivery engine in broker mode"
                );
                let ctx = self.ctx.clone();
                let broker = broker.clone();
                self.background.push(tokio::spawn(recovery_loop(ctx, broker)));
            },
            None => {
                info!(
                    poll_concurrency = self.ctx.config.poll_concurrency,
                    "starting outbox delivery engine in poll mode"
                );
                self.background.push(tokio::spawn(self.poller.clone().run()));
            },
        }

        self.started = true;
        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Stops scheduling new work and waits for in-flight sends to finish.
    /// Rows not yet claimed stay pending; rows claimed but not finished are
    /// reclaimed once stale.
    ///
    /// # Errors
    ///
    /// Returns error if in-flight work outlives the shutdown timeout or a
    /// background task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        let timeout = self.ctx.config.shutdown_timeout;
        self.ctx.cancellation_token.cancel();

        if !self.started {
            info!("delivery engine was not started, shutdown completed immediately");
            return Ok(());
        }

        if let Some(broker) = &self.broker {
            broker.shutdown(timeout).await?;
        }

        let handles = std::mem::take(&mut self.background);
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        let Ok(results) = joined else {
            error!(
                timeout_seconds = timeout.as_secs(),
                "background tasks did not stop within shutdown timeout"
            );
            return Err(DeliveryError::ShutdownTimeout { timeout });
        };

        for result in results {
            if let Err(join_error) = result {
                error!(error = %join_error, "background task panicked during shutdown");
                return Err(DeliveryError::WorkerPanic {
                    task: "delivery background task".to_string(),
                    error: join_error.to_string(),
                });
            }
        }

        info!("delivery engine shutdown completed");
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        let mut stats = self.ctx.stats.read().await.clone();
        if let Some(broker) = &self.broker {
            let broker_stats = broker.stats().await;
            stats.broker_failures = broker_stats.handler_failures;
            stats.abandoned_jobs = broker_stats.abandoned_jobs;
        }
        stats
    }

    /// Runs one evaluation of the broker job for `id` on the calling task.
    ///
    /// Intended for tests and controlled execution; the returned outcome says
    /// whether and when the broker would run the job again.
    ///
    /// # Errors
    ///
    /// Returns the internal error the broker would have handled.
    pub async fn run_job(&self, id: MessageId) -> Result<JobOutcome> {
        self.job.run(id).await
    }

    /// Runs one poll tick on the calling task.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot, a claim, or a finalization fails.
    pub async fn poll_once(&self) -> Result<TickReport> {
        self.poller.tick().await
    }

    /// Schedules broker jobs for every claimable row.
    ///
    /// Returns how many jobs were newly scheduled. Rows that already have a
    /// live job are skipped. Does nothing in poll mode.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot list claimable rows.
    pub async fn recover(&self) -> Result<usize> {
        match &self.broker {
            Some(broker) => recovery_sweep(&self.ctx, broker).await,
            None => Ok(0),
        }
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        let active = self.background.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.ctx.cancellation_token.is_cancelled() {
            error!(
                active_tasks = active,
                "DeliveryEngine dropped with running background tasks, forcing cancellation"
            );
            self.ctx.cancellation_token.cancel();
            warn!("DeliveryEngine was not shut down gracefully. Call shutdown() before dropping.");
        }
    }
}

async fn recovery_sweep(ctx: &DeliveryContext, broker: &JobBroker) -> Result<usize> {
    let stale_before = ctx.earliest_stale_before();
    let ids = ctx.store.list_claimable(stale_before, ctx.config.recovery_batch_size).await?;

    let mut scheduled = 0;
    for id in ids {
        if broker.schedule(id, Duration::ZERO).await {
            scheduled += 1;
        }
    }

    if scheduled > 0 {
        info!(scheduled, "recovery sweep scheduled outbox jobs");
    }
    Ok(scheduled)
}

async fn recovery_loop(ctx: Arc<DeliveryContext>, broker: JobBroker) {
    info!(
        recovery_interval_ms = ctx.config.recovery_interval.as_millis(),
        "recovery loop starting"
    );

    loop {
        if let Err(error) = recovery_sweep(&ctx, &broker).await {
            error!(error = %error, "recovery sweep failed");
        }

        tokio::select! {
            () = ctx.clock.sleep(ctx.config.recovery_interval) => {}
            () = ctx.cancellation_token.cancelled() => break,
        }
    }

    info!("recovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.stale_processing, Duration::from_secs(60));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = DeliveryConfig { worker_concurrency: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(DeliveryError::Configuration { .. })));
    }

    #[test]
    fn empty_rate_limit_window_is_rejected() {
        let config = DeliveryConfig {
            rate_limit: WindowLimit::new(10, Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_threshold_falls_back_to_global() {
        let mut config = DeliveryConfig::default();
        config.stale_processing_overrides.insert(Platform::Youtube, Duration::from_secs(20));

        assert_eq!(config.stale_threshold(Platform::Youtube), Duration::from_secs(20));
        assert_eq!(config.stale_threshold(Platform::Twitch), Duration::from_secs(60));
        assert_eq!(config.shortest_stale_threshold(), Duration::from_secs(20));
    }

    #[test]
    fn average_queue_latency_over_samples() {
        let mut stats = EngineStats::default();
        assert_eq!(stats.average_queue_latency(), None);

        stats.record_queue_latency(Duration::from_millis(100));
        stats.record_queue_latency(Duration::from_millis(300));

        assert_eq!(stats.average_queue_latency(), Some(Duration::from_millis(200)));
        assert_eq!(stats.queue_latency_max, Duration::from_millis(300));
    }
}
