//! Broker-driven delivery job.
//!
//! One job per message. Each run walks the phases below and stops at the
//! first one that cannot proceed:
//!
//! 1. Terminal rows are done.
//! 2. Rows under a live claim are requeued; another worker is on them.
//! 3. Rows whose stored retry time lies ahead are requeued until then, which
//!    holds for every process sharing the store.
//! 4. Destinations that are inactive or not ready are requeued.
//! 5. A held channel lock requeues.
//! 6. A full throttle window requeues until the window rolls over.
//! 7. A lost claim race ends the job; the winner owns the row.
//! 8. Send, finalize, and requeue after backoff if attempts remain.
//!
//! Phases 2 to 6 consume no attempt. The channel lock taken in phase 5 is
//! released in every branch after it. The throttle permit is only taken once
//! the lock is held, and is refunded if the claim then fails.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::models::{LockKey, MessageId, OutboxMessage, OwnerToken};
use tracing::{debug, warn};

use crate::{
    adapter::PlatformSendAdapter,
    broker::{JobHandler, JobOutcome},
    error::{Deferral, Result},
    throttle::ThrottleDecision,
    worker::{DeliveryContext, SendOutcome},
};

/// Job handler running the delivery state machine.
pub(crate) struct BrokerJob {
    ctx: Arc<DeliveryContext>,
}

impl BrokerJob {
    pub(crate) fn new(ctx: Arc<DeliveryContext>) -> Self {
        Self { ctx }
    }

    /// Runs one evaluation of the job for `id`.
    pub(crate) async fn run(&self, id: MessageId) -> Result<JobOutcome> {
        let ctx = &self.ctx;

        let Some(message) = ctx.store.find(id).await? else {
            warn!(message_id = %id, "job for unknown message, dropping");
            return Ok(JobOutcome::Completed);
        };
        if message.is_terminal() {
            debug!(message_id = %id, status = %message.status, "message already terminal");
            return Ok(JobOutcome::Completed);
        }

        let stale_before = ctx.stale_before(message.platform);
        if message.is_claim_live(stale_before) {
            return self
                .deferred(&message, Deferral::claim_in_flight(ctx.config.processing_retry_delay))
                .await;
        }
        if let Some(wait) = message.backoff_remaining(ctx.clock.now_utc()) {
            return self.deferred(&message, Deferral::backoff_pending(wait)).await;
        }
        if self.stopping() {
            return Ok(JobOutcome::Completed);
        }

        let snapshot = ctx.directory.snapshot().await?;
        let Some(adapter) = ctx.ready_adapter(&snapshot, &message).await else {
            return self
                .deferred(&message, Deferral::channel_not_ready(ctx.config.not_ready_delay))
                .await;
        };
        if self.stopping() {
            return Ok(JobOutcome::Completed);
        }

        let owner = OwnerToken::new();
        let acquisition = ctx
            .lock
            .acquire(message.platform, &message.internal_destination_id, owner, ctx.config.lock_ttl)
            .await?;
        if !acquisition.acquired {
            return self
                .deferred(&message, Deferral::lock_unavailable(ctx.config.lock_retry_delay))
                .await;
        }

        let result = self.run_locked(&message, adapter.as_ref()).await;
        self.release_lock(&message, &acquisition.key, owner).await;
        result
    }

    /// Throttle, claim, send, and finalize while holding the channel lock.
    async fn run_locked(
        &self,
        message: &OutboxMessage,
        adapter: &dyn PlatformSendAdapter,
    ) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        if self.stopping() {
            return Ok(JobOutcome::Completed);
        }

        let permit = match ctx
            .throttle
            .try_acquire(message.platform, &message.internal_destination_id)
            .await
        {
            ThrottleDecision::Permit(permit) => permit,
            ThrottleDecision::RetryAfter(wait) => {
                return self.deferred(message, Deferral::throttled(wait)).await;
            },
        };

        let stale_before = ctx.stale_before(message.platform);
        let claimed = match ctx.store.claim_single(message.id, stale_before).await {
            Ok(claimed) => claimed,
            Err(error) => {
                ctx.throttle.refund(permit).await;
                return Err(error.into());
            },
        };
        if !claimed {
            ctx.throttle.refund(permit).await;
            {
                let mut stats = ctx.stats.write().await;
                stats.claim_conflicts += 1;
            }
            debug!(message_id = %message.id, "claim lost to another worker");
            return Ok(JobOutcome::Completed);
        }

        // Attempts may have moved since the first read.
        let Some(claimed) = ctx.store.find(message.id).await? else {
            return Ok(JobOutcome::Completed);
        };
        let claimed_at = claimed.processing_at.unwrap_or_else(|| ctx.clock.now_utc());

        match ctx.send_and_finalize(&claimed, adapter, claimed_at).await? {
            SendOutcome::Retry { delay } => Ok(JobOutcome::Requeue(delay)),
            SendOutcome::Sent | SendOutcome::Failed | SendOutcome::Lost => {
                Ok(JobOutcome::Completed)
            },
        }
    }

    async fn deferred(&self, message: &OutboxMessage, deferral: Deferral) -> Result<JobOutcome> {
        self.ctx.defer(message, deferral).await;
        Ok(JobOutcome::Requeue(deferral.delay))
    }

    async fn release_lock(&self, message: &OutboxMessage, key: &LockKey, owner: OwnerToken) {
        match self.ctx.lock.release(key, owner).await {
            Ok(true) => {},
            Ok(false) => warn!(
                message_id = %message.id,
                lock_key = %key,
                "channel lock expired before release"
            ),
            Err(error) => warn!(
                message_id = %message.id,
                lock_key = %key,
                error = %error,
                "failed to release channel lock, it will expire"
            ),
        }
    }

    fn stopping(&self) -> bool {
        self.ctx.cancellation_token.is_cancelled()
    }
}

#[async_trait]
impl JobHandler for BrokerJob {
    async fn handle(&self, id: MessageId) -> Result<JobOutcome> {
        self.run(id).await
    }
}
