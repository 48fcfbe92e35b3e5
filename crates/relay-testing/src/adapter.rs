//! Scripted platform send adapter.
//!
//! Plays back queued readiness answers and send outcomes, falling back to
//! configurable defaults once a script runs out, and records every call. It
//! also tracks how many sends were in flight per destination at once, which
//! is how tests observe per-destination serialization.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use relay_delivery::{adapter::PlatformSendAdapter, SendError};
use tokio::sync::Mutex;

/// One recorded `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCall {
    /// Platform-native destination id.
    pub destination: String,
    /// Message body.
    pub text: String,
}

#[derive(Debug)]
struct Script {
    readiness: VecDeque<bool>,
    ready_for: HashMap<String, bool>,
    default_ready: bool,
    outcomes: VecDeque<Result<(), SendError>>,
    default_outcome: Result<(), SendError>,
    calls: Vec<SendCall>,
    readiness_checks: usize,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Send adapter driven by a script.
#[derive(Debug)]
pub struct ScriptedAdapter {
    script: Mutex<Script>,
    send_delay: Duration,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdapter {
    /// Adapter that is always ready and always succeeds.
    pub fn new() -> Self {
        Self::with_default_outcome(Ok(()))
    }

    /// Adapter whose every send fails transiently with `message`.
    pub fn always_failing(message: &str) -> Self {
        Self::with_default_outcome(Err(SendError::transient(message)))
    }

    fn with_default_outcome(default_outcome: Result<(), SendError>) -> Self {
        Self {
            script: Mutex::new(Script {
                readiness: VecDeque::new(),
                ready_for: HashMap::new(),
                default_ready: true,
                outcomes: VecDeque::new(),
                default_outcome,
                calls: Vec::new(),
                readiness_checks: 0,
                in_flight: HashMap::new(),
                max_in_flight: HashMap::new(),
            }),
            send_delay: Duration::ZERO,
        }
    }

    /// Holds every send for `delay` of real time before answering.
    #[must_use]
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Queues readiness answers, consumed one per check.
    pub async fn script_readiness(&self, answers: impl IntoIterator<Item = bool>) {
        self.script.lock().await.readiness.extend(answers);
    }

    /// Sets the readiness answer used once the queue is empty.
    pub async fn set_ready(&self, ready: bool) {
        self.script.lock().await.default_ready = ready;
    }

    /// Pins the readiness answer for one platform-native destination. Queued
    /// answers still take precedence.
    pub async fn set_ready_for(&self, external_destination_id: &str, ready: bool) {
        self.script.lock().await.ready_for.insert(external_destination_id.to_string(), ready);
    }

    /// Queues send outcomes, consumed one per send.
    pub async fn script_outcomes(
        &self,
        outcomes: impl IntoIterator<Item = Result<(), SendError>>,
    ) {
        self.script.lock().await.outcomes.extend(outcomes);
    }

    /// Sets the send outcome used once the queue is empty.
    pub async fn set_default_outcome(&self, outcome: Result<(), SendError>) {
        self.script.lock().await.default_outcome = outcome;
    }

    /// Recorded sends, in call order.
    pub async fn sends(&self) -> Vec<SendCall> {
        self.script.lock().await.calls.clone()
    }

    /// Number of sends made.
    pub async fn send_count(&self) -> usize {
        self.script.lock().await.calls.len()
    }

    /// Number of readiness checks answered.
    pub async fn readiness_checks(&self) -> usize {
        self.script.lock().await.readiness_checks
    }

    /// Highest number of simultaneous sends seen for one destination.
    pub async fn max_concurrent_sends(&self, destination: &str) -> usize {
        self.script.lock().await.max_in_flight.get(destination).copied().unwrap_or(0)
    }

    /// Highest per-destination concurrency over all destinations.
    pub async fn max_concurrent_sends_any(&self) -> usize {
        self.script.lock().await.max_in_flight.values().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl PlatformSendAdapter for ScriptedAdapter {
    async fn is_ready(&self, external_destination_id: &str) -> Result<bool, SendError> {
        let mut script = self.script.lock().await;
        script.readiness_checks += 1;
        let default =
            script.ready_for.get(external_destination_id).copied().unwrap_or(script.default_ready);
        Ok(script.readiness.pop_front().unwrap_or(default))
    }

    async fn send(&self, external_destination_id: &str, text: &str) -> Result<(), SendError> {
        let outcome = {
            let mut script = self.script.lock().await;
            script.calls.push(SendCall {
                destination: external_destination_id.to_string(),
                text: text.to_string(),
            });
            let destination = external_destination_id.to_string();
            let current = {
                let count = script.in_flight.entry(destination.clone()).or_default();
                *count += 1;
                *count
            };
            let max = script.max_in_flight.entry(destination).or_default();
            *max = (*max).max(current);

            let default = script.default_outcome.clone();
            script.outcomes.pop_front().unwrap_or(default)
        };

        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        let mut script = self.script.lock().await;
        if let Some(count) = script.in_flight.get_mut(external_destination_id) {
            *count = count.saturating_sub(1);
        }
        outcome
    }
}
