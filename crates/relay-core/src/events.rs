//! Delivery events and subscriber dispatch.
//!
//! The delivery engine reports every outcome of a job run as a
//! [`DeliveryEvent`]. Subscribers (metrics exporters, audit sinks, test
//! recorders) implement [`EventHandler`] and are fanned out to through a
//! [`MulticastEventHandler`] without the engine knowing about any of them.
//!
//! ```text
//!                     Sent / Retried / Deferred / DeadLettered
//! ┌─────────────────┐                 ┌────────────────────┐
//! │ DeliveryEngine  │ ──────────────▶ │ MulticastHandler   │
//! └─────────────────┘                 └────────────────────┘
//!                                        │         │
//!                                        ▼         ▼
//!                                  subscriber   subscriber
//! ```

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DestinationId, MessageId, Platform};

/// Events emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// Message was handed to the platform successfully.
    Sent(DeliverySentEvent),

    /// Send attempt failed and the message was put back for retry.
    Retried(DeliveryRetriedEvent),

    /// Job was postponed without consuming an attempt.
    Deferred(DeliveryDeferredEvent),

    /// Attempts were exhausted and the message is permanently failed.
    DeadLettered(DeadLetteredEvent),
}

impl DeliveryEvent {
    /// Message the event refers to.
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Sent(e) => e.message_id,
            Self::Retried(e) => e.message_id,
            Self::Deferred(e) => e.message_id,
            Self::DeadLettered(e) => e.message_id,
        }
    }
}

/// Emitted when a send attempt succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySentEvent {
    /// Delivered message.
    pub message_id: MessageId,
    /// Platform of the destination.
    pub platform: Platform,
    /// Internal destination.
    pub destination: DestinationId,
    /// Attempts recorded before this successful send.
    pub prior_attempts: u32,
    /// When the row was finalized as sent.
    pub sent_at: DateTime<Utc>,
    /// Time from message creation to the claim that delivered it.
    pub queue_latency: Duration,
}

/// Emitted when a failed attempt leaves attempts remaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRetriedEvent {
    /// Message that failed.
    pub message_id: MessageId,
    /// Platform of the destination.
    pub platform: Platform,
    /// Internal destination.
    pub destination: DestinationId,
    /// Attempt count after this failure.
    pub attempts: u32,
    /// Backoff before the next attempt.
    pub retry_in: Duration,
    /// Adapter error text.
    pub error: String,
}

/// Why a job was postponed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferralReason {
    /// Destination missing from the snapshot or adapter reported not ready.
    ChannelNotReady,
    /// Another worker holds the channel lock.
    LockUnavailable,
    /// Send throttle had no permit left in the current window.
    Throttled,
    /// Another worker holds a live claim on the row.
    ClaimInFlight,
    /// Message is still inside its retry backoff window.
    BackoffPending,
}

impl fmt::Display for DeferralReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChannelNotReady => "channel_not_ready",
            Self::LockUnavailable => "lock_unavailable",
            Self::Throttled => "throttled",
            Self::ClaimInFlight => "claim_in_flight",
            Self::BackoffPending => "backoff_pending",
        };
        f.write_str(name)
    }
}

/// Emitted when a job is requeued without an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDeferredEvent {
    /// Deferred message.
    pub message_id: MessageId,
    /// Internal destination.
    pub destination: DestinationId,
    /// Why it was deferred.
    pub reason: DeferralReason,
    /// Delay before the next evaluation.
    pub retry_in: Duration,
}

/// Emitted when a message is finalized as failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredEvent {
    /// Failed message.
    pub message_id: MessageId,
    /// Platform of the destination.
    pub platform: Platform,
    /// Internal destination.
    pub destination: DestinationId,
    /// Final attempt count.
    pub attempts: u32,
    /// Error from the last attempt.
    pub last_error: String,
    /// When the row was marked failed.
    pub failed_at: DateTime<Utc>,
}

/// Trait for handling delivery events.
///
/// Handlers must not block delivery: failures inside a handler are logged by
/// the handler itself and never propagated back to the engine.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// No-op event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards each event to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber to receive delivery events.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deferred_event() -> DeliveryEvent {
        DeliveryEvent::Deferred(DeliveryDeferredEvent {
            message_id: MessageId::new(),
            destination: DestinationId::new("chan-1"),
            reason: DeferralReason::ChannelNotReady,
            retry_in: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn multicast_handler_forwards_to_all_subscribers() {
        let mut multicast = MulticastEventHandler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        multicast.add_subscriber(Arc::new(CountingHandler { count: first.clone() }));
        multicast.add_subscriber(Arc::new(CountingHandler { count: second.clone() }));

        assert_eq!(multicast.subscriber_count(), 2);
        multicast.handle_event(deferred_event()).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_handler_handles_empty_subscribers() {
        MulticastEventHandler::new().handle_event(deferred_event()).await;
        NoOpEventHandler::new().handle_event(deferred_event()).await;
    }

    #[test]
    fn deferral_reason_display_is_snake_case() {
        assert_eq!(DeferralReason::LockUnavailable.to_string(), "lock_unavailable");
        assert_eq!(DeferralReason::BackoffPending.to_string(), "backoff_pending");
    }
}
