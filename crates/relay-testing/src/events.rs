//! Event recording for delivery assertions.
//!
//! [`RecordingEventHandler`] keeps every event the engine emits and lets a
//! test wait, with a deadline, until a condition over them holds.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use relay_core::{
    events::{DeferralReason, DeliveryEvent},
    models::MessageId,
    EventHandler,
};
use tokio::sync::{Notify, RwLock};

/// Event handler that records every delivery event.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventHandler {
    events: Arc<RwLock<Vec<DeliveryEvent>>>,
    notify: Arc<Notify>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.read().await.clone()
    }

    /// Events about one message.
    pub async fn events_for(&self, id: MessageId) -> Vec<DeliveryEvent> {
        self.events.read().await.iter().filter(|e| e.message_id() == id).cloned().collect()
    }

    /// Number of `Sent` events.
    pub async fn sent_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Sent(_))).await
    }

    /// Number of `Retried` events.
    pub async fn retried_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Retried(_))).await
    }

    /// Number of `DeadLettered` events.
    pub async fn dead_lettered_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::DeadLettered(_))).await
    }

    /// Number of `Deferred` events with the given reason.
    pub async fn deferred_count(&self, reason: DeferralReason) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Deferred(d) if d.reason == reason)).await
    }

    /// Number of events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `expected` events match `predicate`.
    ///
    /// # Errors
    ///
    /// Returns error if `timeout` of real time passes first.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&DeliveryEvent) -> bool,
        expected: usize,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.count(&predicate).await >= expected {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let seen = self.count(&predicate).await;
                bail!("timed out waiting for {expected} matching events, saw {seen}");
            }
        }
    }

    /// Forgets all recorded events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}
