//! Broker-less poll loop.
//!
//! Each tick checks the readiness of every active destination, then claims a
//! batch of rows across the ready ones and sends them, one destination queue
//! at a time or several queues concurrently, but always in `created_at` order
//! within a destination. No channel lock is taken: the loop assumes it is the
//! only sender in the deployment.
//!
//! Destinations that are not ready, or whose head row is still inside its
//! retry backoff, are never claimed, so they cannot crowd ready destinations
//! out of the batch. When a queue stops early (failed send, shutdown) the
//! rest of it is handed back with `release_claim`, so ordering survives and
//! no attempt is consumed.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{stream, StreamExt};
use relay_core::models::{DestinationId, DestinationInfo, OutboxMessage, Platform};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{DestinationSnapshot, PlatformSendAdapter},
    error::{DeliveryError, Result},
    worker::{DeliveryContext, SendOutcome},
};

/// Summary of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tick did nothing because the previous one was still running.
    pub skipped: bool,
    /// Rows claimed by this tick.
    pub claimed: usize,
    /// Rows finalized as sent.
    pub sent: usize,
    /// Rows returned to pending after a failed attempt.
    pub retried: usize,
    /// Rows finalized as failed.
    pub failed: usize,
    /// Rows handed back without an attempt.
    pub released: usize,
    /// Active destinations left unclaimed because they were not ready.
    pub not_ready: usize,
}

impl TickReport {
    fn merge(&mut self, other: Self) {
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
        self.released += other.released;
    }
}

/// Clears the re-entrancy flag when a tick ends, including on error.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Destination queue key. One internal channel may be live on several
/// platforms, each with its own queue.
type QueueKey = (Platform, DestinationId);

pub(crate) struct Poller {
    ctx: Arc<DeliveryContext>,
    ticking: AtomicBool,
}

impl Poller {
    pub(crate) fn new(ctx: Arc<DeliveryContext>) -> Self {
        Self { ctx, ticking: AtomicBool::new(false) }
    }

    /// Runs ticks every poll interval until cancelled.
    ///
    /// Each tick runs on its own task so a slow tick makes the next one skip
    /// instead of delaying the schedule.
    pub(crate) async fn run(self: Arc<Self>) {
        let ctx = self.ctx.clone();
        info!(
            poll_interval_ms = ctx.config.poll_interval.as_millis(),
            batch_size = ctx.config.batch_size,
            "poll loop starting"
        );

        let mut ticks: Vec<JoinHandle<()>> = Vec::new();
        loop {
            ticks.retain(|handle| !handle.is_finished());

            let poller = self.clone();
            ticks.push(tokio::spawn(async move {
                if let Err(error) = poller.tick().await {
                    error!(error = %error, "poll tick failed");
                }
            }));

            tokio::select! {
                () = ctx.clock.sleep(ctx.config.poll_interval) => {}
                () = ctx.cancellation_token.cancelled() => break,
            }
        }

        for handle in ticks {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "poll tick panicked during shutdown");
            }
        }
        info!("poll loop stopped");
    }

    /// Runs one tick unless another tick is in progress.
    ///
    /// # Errors
    ///
    /// Returns error if the destination snapshot or a claim fails, or if the
    /// store fails while finalizing a row.
    pub(crate) async fn tick(&self) -> Result<TickReport> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous poll tick still running, skipping");
            return Ok(TickReport { skipped: true, ..TickReport::default() });
        }
        let _guard = TickGuard(&self.ticking);

        let snapshot = self.ctx.directory.snapshot().await?;
        if snapshot.is_empty() {
            return Ok(TickReport::default());
        }

        let (claimed, not_ready) = self.claim(&snapshot).await?;
        let mut report = TickReport { claimed: claimed.len(), not_ready, ..TickReport::default() };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut queues: BTreeMap<QueueKey, Vec<OutboxMessage>> = BTreeMap::new();
        for message in claimed {
            let key = (message.platform, message.internal_destination_id.clone());
            queues.entry(key).or_default().push(message);
        }
        for queue in queues.values_mut() {
            queue.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        }

        let drains: Vec<_> = queues.into_values().map(|queue| self.drain_queue(queue)).collect();
        let results: Vec<Result<TickReport>> = stream::iter(drains)
            .buffer_unordered(self.ctx.config.poll_concurrency.max(1))
            .collect()
            .await;

        let mut first_error: Option<DeliveryError> = None;
        for result in results {
            match result {
                Ok(queue_report) => report.merge(queue_report),
                Err(error) => {
                    first_error.get_or_insert(error);
                },
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        debug!(
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            released = report.released,
            not_ready = report.not_ready,
            "poll tick completed"
        );
        Ok(report)
    }

    /// Claims rows of ready destinations, per platform so each uses its own
    /// stale threshold. All platforms share the batch budget.
    ///
    /// Returns the claimed rows and how many destinations were skipped as not
    /// ready.
    async fn claim(&self, snapshot: &DestinationSnapshot) -> Result<(Vec<OutboxMessage>, usize)> {
        let mut budget = self.ctx.config.batch_size;
        let mut claimed = Vec::new();
        let mut not_ready = 0;

        for (platform, destinations) in snapshot.by_platform() {
            if budget == 0 {
                break;
            }
            let Some(adapter) = self.ctx.adapters.get(platform).cloned() else {
                warn!(platform = %platform, "no send adapter registered for platform");
                not_ready += destinations.len();
                continue;
            };

            let total = destinations.len();
            let ready = self.ready_destinations(adapter, destinations).await;
            not_ready += total - ready.len();
            if ready.is_empty() {
                continue;
            }

            let stale_before = self.ctx.stale_before(platform);
            let batch = self.ctx.store.claim_batch(platform, ready, stale_before, budget).await?;
            budget = budget.saturating_sub(batch.len());
            claimed.extend(batch);
        }

        Ok((claimed, not_ready))
    }

    /// Checks destinations concurrently and keeps the ready ones.
    async fn ready_destinations(
        &self,
        adapter: Arc<dyn PlatformSendAdapter>,
        destinations: Vec<DestinationInfo>,
    ) -> Vec<DestinationId> {
        let adapter = adapter.as_ref();
        let checks = destinations.into_iter().map(|info| async move {
            let ready = self.ctx.check_ready(adapter, &info.internal_id, &info.external_id).await;
            if !ready {
                debug!(
                    platform = %info.platform,
                    destination = %info.internal_id,
                    "destination not ready, leaving its rows unclaimed"
                );
            }
            ready.then_some(info.internal_id)
        });

        let mut ready: Vec<DestinationId> = stream::iter(checks)
            .buffer_unordered(self.ctx.config.poll_concurrency.max(1))
            .filter_map(|id| async move { id })
            .collect()
            .await;
        ready.sort();
        ready
    }

    /// Sends one destination's claimed rows in order.
    async fn drain_queue(&self, queue: Vec<OutboxMessage>) -> Result<TickReport> {
        let ctx = &self.ctx;
        let mut report = TickReport::default();

        for (index, message) in queue.iter().enumerate() {
            if ctx.cancellation_token.is_cancelled() {
                report.released += self.release(&queue[index..]).await;
                break;
            }

            let Some(adapter) = ctx.adapters.get(message.platform).cloned() else {
                report.released += self.release(&queue[index..]).await;
                break;
            };

            let claimed_at = message.processing_at.unwrap_or_else(|| ctx.clock.now_utc());
            let outcome = match ctx.send_and_finalize(message, adapter.as_ref(), claimed_at).await
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    report.released += self.release(&queue[index + 1..]).await;
                    return Err(error);
                },
            };

            match outcome {
                SendOutcome::Sent => report.sent += 1,
                SendOutcome::Failed => report.failed += 1,
                SendOutcome::Lost => {},
                SendOutcome::Retry { .. } => {
                    report.retried += 1;
                    report.released += self.release(&queue[index + 1..]).await;
                    break;
                },
            }
        }

        Ok(report)
    }

    /// Hands rows back to pending. Returns how many were released.
    async fn release(&self, messages: &[OutboxMessage]) -> usize {
        let mut released = 0;
        for message in messages {
            match self.ctx.store.release_claim(message.id).await {
                Ok(true) => released += 1,
                Ok(false) => {},
                Err(error) => warn!(
                    message_id = %message.id,
                    error = %error,
                    "failed to release claim, row will be reclaimed once stale"
                ),
            }
        }
        released
    }
}
