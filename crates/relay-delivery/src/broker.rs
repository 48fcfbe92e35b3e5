//! In-process job broker.
//!
//! Runs a handler for a message id now or after a delay, with parallelism
//! bounded by a semaphore. A handler either finishes the job or asks to be
//! run again after a delay; that self-requeue is how deferrals and retry
//! backoff are expressed. Handler errors are the broker's own business: they
//! are logged, retried after a fixed delay, and the job is abandoned after too
//! many consecutive failures. Abandoned rows are picked up again by the
//! engine's recovery sweep.
//!
//! At most one job per message id is live at a time. Scheduling an id that
//! already has a live job is a no-op, so recovery sweeps cannot bypass a
//! pending backoff by starting a second job for the same row.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use relay_core::{models::MessageId, Clock};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};

/// What the broker should do with a job after its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing left to do for this message.
    Completed,
    /// Run the handler again after the delay.
    Requeue(Duration),
}

/// Executes one job for a message.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Runs the job. Errors are internal failures for the broker to handle.
    async fn handle(&self, id: MessageId) -> Result<JobOutcome>;
}

/// Broker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Handlers running at once.
    pub concurrency: usize,
    /// Delay before re-running a job whose handler failed.
    pub failure_delay: Duration,
    /// Consecutive handler failures after which a job is abandoned.
    pub max_failures: u32,
}

/// Counters kept by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Jobs currently scheduled or running.
    pub live_jobs: usize,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Jobs given up after `max_failures` consecutive failures.
    pub abandoned_jobs: u64,
}

struct Inner {
    config: BrokerConfig,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    live: Mutex<HashSet<MessageId>>,
    handler_failures: AtomicU64,
    abandoned_jobs: AtomicU64,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

/// Scheduler running job handlers on the tokio runtime.
#[derive(Clone)]
pub struct JobBroker {
    inner: Arc<Inner>,
}

impl JobBroker {
    /// Creates a broker. Jobs stop being started once `cancellation_token`
    /// is cancelled.
    pub fn new(
        config: BrokerConfig,
        handler: Arc<dyn JobHandler>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                config: BrokerConfig { concurrency, ..config },
                handler,
                permits: Arc::new(Semaphore::new(concurrency)),
                live: Mutex::new(HashSet::new()),
                handler_failures: AtomicU64::new(0),
                abandoned_jobs: AtomicU64::new(0),
                clock,
                cancellation_token,
            }),
        }
    }

    /// Schedules a job for `id` after `delay`.
    ///
    /// Returns `false` if a job for `id` is already live or the broker is
    /// shutting down.
    pub async fn schedule(&self, id: MessageId, delay: Duration) -> bool {
        if self.inner.cancellation_token.is_cancelled() {
            return false;
        }
        if !self.inner.live.lock().await.insert(id) {
            debug!(message_id = %id, "job already live, not scheduling duplicate");
            return false;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(id, delay).await;
            inner.live.lock().await.remove(&id);
        });
        true
    }

    /// Returns current broker counters.
    pub async fn stats(&self) -> BrokerStats {
        BrokerStats {
            live_jobs: self.inner.live.lock().await.len(),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
            abandoned_jobs: self.inner.abandoned_jobs.load(Ordering::Relaxed),
        }
    }

    /// Stops starting jobs and waits for running handlers to finish.
    ///
    /// Scheduled jobs that have not started are dropped; their rows stay
    /// claimable and are recovered on the next start.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if handlers are still running
    /// when `timeout` elapses.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.cancellation_token.cancel();

        let all_permits = u32::try_from(self.inner.config.concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.inner.permits.acquire_many(all_permits)).await {
            Ok(_permits) => {
                info!("job broker drained");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "job broker shutdown timed out with handlers still running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Inner {
    /// Runs one job until it completes, is abandoned, or the broker stops.
    async fn drive(&self, id: MessageId, mut delay: Duration) {
        let mut consecutive_failures = 0_u32;

        loop {
            if !delay.is_zero() {
                tokio::select! {
                    () = self.clock.sleep(delay) => {}
                    () = self.cancellation_token.cancelled() => return,
                }
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => return,
                },
                () = self.cancellation_token.cancelled() => return,
            };
            if self.cancellation_token.is_cancelled() {
                return;
            }

            let handler = self.handler.clone();
            let result = match tokio::spawn(async move { handler.handle(id).await }).await {
                Ok(result) => result,
                Err(join_error) => Err(DeliveryError::WorkerPanic {
                    task: format!("job {id}"),
                    error: join_error.to_string(),
                }),
            };
            drop(permit);

            match result {
                Ok(JobOutcome::Completed) => return,
                Ok(JobOutcome::Requeue(next)) => {
                    consecutive_failures = 0;
                    delay = next;
                },
                Err(error) => {
                    consecutive_failures += 1;
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);

                    if consecutive_failures >= self.config.max_failures {
                        self.abandoned_jobs.fetch_add(1, Ordering::Relaxed);
                        error!(
                            message_id = %id,
                            failures = consecutive_failures,
                            error = %error,
                            "abandoning job after repeated internal failures"
                        );
                        return;
                    }

                    warn!(
                        message_id = %id,
                        failures = consecutive_failures,
                        error = %error,
                        "job handler failed, rescheduling"
                    );
                    delay = self.config.failure_delay;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use relay_core::RealClock;

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        requeues: usize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _id: MessageId) -> Result<JobOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeliveryError::store("store unavailable"));
            }
            if call < self.requeues {
                return Ok(JobOutcome::Requeue(Duration::from_millis(1)));
            }
            Ok(JobOutcome::Completed)
        }
    }

    fn broker(handler: Arc<CountingHandler>, max_failures: u32) -> JobBroker {
        let config = BrokerConfig {
            concurrency: 2,
            failure_delay: Duration::from_millis(1),
            max_failures,
        };
        JobBroker::new(config, handler, Arc::new(RealClock::new()), CancellationToken::new())
    }

    async fn wait_until_idle(broker: &JobBroker) {
        for _ in 0..500 {
            if broker.stats().await.live_jobs == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("broker did not become idle");
    }

    #[tokio::test]
    async fn requeued_job_runs_until_completed() {
        let handler = Arc::new(CountingHandler { requeues: 3, ..Default::default() });
        let broker = broker(handler.clone(), 3);

        assert!(broker.schedule(MessageId::new(), Duration::ZERO).await);
        wait_until_idle(&broker).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failing_job_is_abandoned_after_max_failures() {
        let handler = Arc::new(CountingHandler { fail: true, ..Default::default() });
        let broker = broker(handler.clone(), 3);

        broker.schedule(MessageId::new(), Duration::ZERO).await;
        wait_until_idle(&broker).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let stats = broker.stats().await;
        assert_eq!(stats.handler_failures, 3);
        assert_eq!(stats.abandoned_jobs, 1);
    }

    #[tokio::test]
    async fn duplicate_schedule_is_ignored_while_live() {
        let handler = Arc::new(CountingHandler::default());
        let broker = broker(handler.clone(), 3);
        let id = MessageId::new();

        assert!(broker.schedule(id, Duration::from_millis(20)).await);
        assert!(!broker.schedule(id, Duration::ZERO).await);
        wait_until_idle(&broker).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_scheduling() {
        let handler = Arc::new(CountingHandler::default());
        let broker = broker(handler.clone(), 3);

        broker.schedule(MessageId::new(), Duration::from_secs(60)).await;
        broker.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(!broker.schedule(MessageId::new(), Duration::ZERO).await);
        wait_until_idle(&broker).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
