//! Shared delivery context and the send/finalize path.
//!
//! Both execution strategies (broker jobs and the poll loop) hold a
//! [`DeliveryContext`] and finish every claimed row through
//! [`DeliveryContext::send_and_finalize`], so the attempt accounting and the
//! retry/dead-letter decision are identical regardless of how a row was
//! claimed.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use relay_core::{
    models::{DestinationId, OutboxMessage, Platform},
    Clock, DeadLetteredEvent, DeliveryDeferredEvent, DeliveryEvent, DeliveryRetriedEvent,
    DeliverySentEvent, EventHandler,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{AdapterRegistry, DestinationDirectory, DestinationSnapshot, PlatformSendAdapter},
    engine::{DeliveryConfig, EngineStats},
    error::{Deferral, Result},
    lock::ChannelLock,
    store::OutboxStore,
    throttle::SendThrottle,
};

/// Result of one executed send attempt after finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// Row finalized as sent.
    Sent,
    /// Row returned to pending; next attempt after `delay`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Attempts exhausted; row finalized as failed and dead-lettered.
    Failed,
    /// Row was already terminal when finalizing, typically because a
    /// stale-claim takeover finished it first.
    Lost,
}

/// Collaborators and settings shared by every job run and poll tick.
pub(crate) struct DeliveryContext {
    pub(crate) config: DeliveryConfig,
    pub(crate) store: Arc<dyn OutboxStore>,
    pub(crate) lock: Arc<dyn ChannelLock>,
    pub(crate) throttle: SendThrottle,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) directory: Arc<dyn DestinationDirectory>,
    pub(crate) event_handler: Arc<dyn EventHandler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) cancellation_token: CancellationToken,
}

impl DeliveryContext {
    /// Claims older than the returned instant are stale for `platform`.
    pub(crate) fn stale_before(&self, platform: Platform) -> DateTime<Utc> {
        stale_cutoff(self.clock.now_utc(), self.config.stale_threshold(platform))
    }

    /// Stale cutoff using the shortest configured threshold.
    ///
    /// Used where rows of every platform are listed at once; callers re-check
    /// each row against its own platform's threshold.
    pub(crate) fn earliest_stale_before(&self) -> DateTime<Utc> {
        stale_cutoff(self.clock.now_utc(), self.config.shortest_stale_threshold())
    }

    /// Returns the adapter for `message` if its destination can take a send
    /// right now.
    ///
    /// Inactive destinations, platforms without an adapter, and readiness
    /// readiness check failures all count as not ready.
    pub(crate) async fn ready_adapter(
        &self,
        snapshot: &DestinationSnapshot,
        message: &OutboxMessage,
    ) -> Option<Arc<dyn PlatformSendAdapter>> {
        if !snapshot.is_active(message.platform, &message.internal_destination_id) {
            debug!(
                message_id = %message.id,
                destination = %message.internal_destination_id,
                "destination not in active snapshot"
            );
            return None;
        }

        let Some(adapter) = self.adapters.get(message.platform) else {
            warn!(
                message_id = %message.id,
                platform = %message.platform,
                "no send adapter registered for platform"
            );
            return None;
        };

        let ready = self
            .check_ready(
                adapter.as_ref(),
                &message.internal_destination_id,
                &message.external_destination_id,
            )
            .await;
        ready.then(|| adapter.clone())
    }

    /// Asks the adapter whether a destination is ready. Check failures count
    /// as not ready.
    pub(crate) async fn check_ready(
        &self,
        adapter: &dyn PlatformSendAdapter,
        destination: &DestinationId,
        external_destination_id: &str,
    ) -> bool {
        match adapter.is_ready(external_destination_id).await {
            Ok(ready) => ready,
            Err(error) => {
                warn!(
                    destination = %destination,
                    error = %error,
                    "readiness check failed, treating destination as not ready"
                );
                false
            },
        }
    }

    /// Records a deferral and reports it to subscribers.
    pub(crate) async fn defer(&self, message: &OutboxMessage, deferral: Deferral) {
        {
            let mut stats = self.stats.write().await;
            stats.deferred += 1;
        }

        debug!(
            message_id = %message.id,
            destination = %message.internal_destination_id,
            reason = %deferral.reason,
            retry_in_ms = deferral.delay.as_millis(),
            "delivery deferred"
        );

        self.event_handler
            .handle_event(DeliveryEvent::Deferred(DeliveryDeferredEvent {
                message_id: message.id,
                destination: message.internal_destination_id.clone(),
                reason: deferral.reason,
                retry_in: deferral.delay,
            }))
            .await;
    }

    /// Executes one send attempt for a claimed row and finalizes it.
    ///
    /// `message` must reflect the row as claimed, since the attempt count is
    /// derived from it. Every call consumes exactly one attempt unless the
    /// send succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails while finalizing. Send failures are
    /// recorded on the row and never returned.
    pub(crate) async fn send_and_finalize(
        &self,
        message: &OutboxMessage,
        adapter: &dyn PlatformSendAdapter,
        claimed_at: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_sends += 1;
        }

        let send_result =
            adapter.send(&message.external_destination_id, &message.payload_text).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight_sends = stats.in_flight_sends.saturating_sub(1);
        }

        match send_result {
            Ok(()) => self.finalize_sent(message, claimed_at).await,
            Err(send_error) => self.finalize_failure(message, send_error.to_string()).await,
        }
    }

    async fn finalize_sent(
        &self,
        message: &OutboxMessage,
        claimed_at: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        if !self.store.finalize_sent(message.id).await? {
            warn!(message_id = %message.id, "sent message was already finalized elsewhere");
            return Ok(SendOutcome::Lost);
        }

        let queue_latency = (claimed_at - message.created_at).to_std().unwrap_or_default();
        {
            let mut stats = self.stats.write().await;
            stats.sent += 1;
            stats.record_queue_latency(queue_latency);
        }

        info!(
            message_id = %message.id,
            platform = %message.platform,
            destination = %message.internal_destination_id,
            attempt = message.attempts + 1,
            queue_latency_ms = queue_latency.as_millis(),
            "message delivered"
        );

        self.event_handler
            .handle_event(DeliveryEvent::Sent(DeliverySentEvent {
                message_id: message.id,
                platform: message.platform,
                destination: message.internal_destination_id.clone(),
                prior_attempts: message.attempts,
                sent_at: self.clock.now_utc(),
                queue_latency,
            }))
            .await;

        Ok(SendOutcome::Sent)
    }

    async fn finalize_failure(
        &self,
        message: &OutboxMessage,
        error: String,
    ) -> Result<SendOutcome> {
        let next_attempts = message.attempts.saturating_add(1);

        if next_attempts >= self.config.max_attempts {
            let Some(dead_letter) =
                self.store.finalize_failed(message.id, next_attempts, error.clone()).await?
            else {
                return Ok(SendOutcome::Lost);
            };

            {
                let mut stats = self.stats.write().await;
                stats.failed += 1;
            }

            error!(
                message_id = %message.id,
                platform = %message.platform,
                destination = %message.internal_destination_id,
                attempts = dead_letter.attempts,
                error = %error,
                "delivery attempts exhausted, message dead-lettered"
            );

            self.event_handler
                .handle_event(DeliveryEvent::DeadLettered(DeadLetteredEvent {
                    message_id: message.id,
                    platform: message.platform,
                    destination: message.internal_destination_id.clone(),
                    attempts: dead_letter.attempts,
                    last_error: error,
                    failed_at: dead_letter.failed_at,
                }))
                .await;

            return Ok(SendOutcome::Failed);
        }

        let delay = self.config.backoff.compute_for(next_attempts, message.id);
        let retry_at = retry_time(self.clock.now_utc(), delay);
        if !self.store.finalize_retry(message.id, next_attempts, error.clone(), retry_at).await? {
            return Ok(SendOutcome::Lost);
        }

        {
            let mut stats = self.stats.write().await;
            stats.retried += 1;
        }

        warn!(
            message_id = %message.id,
            destination = %message.internal_destination_id,
            attempt = next_attempts,
            retry_in_ms = delay.as_millis(),
            error = %error,
            "send failed, scheduling retry"
        );

        self.event_handler
            .handle_event(DeliveryEvent::Retried(DeliveryRetriedEvent {
                message_id: message.id,
                platform: message.platform,
                destination: message.internal_destination_id.clone(),
                attempts: next_attempts,
                retry_in: delay,
                error,
            }))
            .await;

        Ok(SendOutcome::Retry { delay })
    }
}

fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn retry_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
