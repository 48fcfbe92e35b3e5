//! Send throughput throttle.
//!
//! Fixed-window counters bound how many sends may start per window, once
//! globally and optionally once per destination. Destination windows are
//! keyed like channel locks, so one internal channel on two platforms is
//! throttled per platform. A denied request learns how long until the window
//! that denied it rolls over, which becomes the job's requeue delay.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use relay_core::{
    models::{DestinationId, LockKey, Platform},
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Per-destination windows kept before idle entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Maximum permits per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Permits granted per window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
}

impl WindowLimit {
    /// Creates a limit of `max` permits per `window`.
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

/// A granted send slot. Hand it back with [`SendThrottle::refund`] if the
/// send it was taken for does not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePermit {
    key: LockKey,
    granted_at: Instant,
}

/// Result of asking the throttle for a permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Send may proceed.
    Permit(ThrottlePermit),
    /// No permit available until the given delay has passed.
    RetryAfter(Duration),
}

impl ThrottleDecision {
    /// Whether a permit was granted.
    pub fn is_permit(&self) -> bool {
        matches!(self, Self::Permit(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { started: now, used: 0 }
    }

    /// Starts a fresh window if the current one is over.
    fn roll(&mut self, now: Instant, limit: WindowLimit) {
        if now.duration_since(self.started) >= limit.window {
            *self = Self::new(now);
        }
    }

    /// Gives back one permit granted at `granted_at`, unless the window it
    /// was counted in has already rolled over.
    fn refund(&mut self, granted_at: Instant) {
        if self.started <= granted_at {
            self.used = self.used.saturating_sub(1);
        }
    }

    /// Remaining wait when the window is exhausted.
    fn wait(&self, now: Instant, limit: WindowLimit) -> Option<Duration> {
        (self.used >= limit.max)
            .then(|| limit.window.saturating_sub(now.duration_since(self.started)))
    }
}

#[derive(Debug)]
struct ThrottleState {
    global: Window,
    destinations: HashMap<LockKey, Window>,
}

/// Global and per-destination fixed-window rate limiter.
///
/// A permit is only consumed when every applicable window has room, so a
/// request denied by its destination's window does not eat into the global
/// budget.
#[derive(Clone)]
pub struct SendThrottle {
    global: WindowLimit,
    per_destination: Option<WindowLimit>,
    state: Arc<Mutex<ThrottleState>>,
    clock: Arc<dyn Clock>,
}

impl SendThrottle {
    /// Creates a throttle with a global limit.
    pub fn new(global: WindowLimit, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            global,
            per_destination: None,
            state: Arc::new(Mutex::new(ThrottleState {
                global: Window::new(now),
                destinations: HashMap::new(),
            })),
            clock,
        }
    }

    /// Adds a per-destination limit.
    #[must_use]
    pub fn with_per_destination(mut self, limit: WindowLimit) -> Self {
        self.per_destination = Some(limit);
        self
    }

    /// Requests a permit for one send to `destination` on `platform`.
    pub async fn try_acquire(
        &self,
        platform: Platform,
        destination: &DestinationId,
    ) -> ThrottleDecision {
        let key = LockKey::for_destination(platform, destination);
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        state.global.roll(now, self.global);
        let mut wait = state.global.wait(now, self.global);

        if let Some(limit) = self.per_destination {
            if state.destinations.len() >= PRUNE_THRESHOLD {
                state.destinations.retain(|_, w| now.duration_since(w.started) < limit.window);
            }
            let window = state.destinations.entry(key.clone()).or_insert_with(|| Window::new(now));
            window.roll(now, limit);
            if let Some(destination_wait) = window.wait(now, limit) {
                wait = Some(wait.map_or(destination_wait, |w| w.max(destination_wait)));
            }
        }

        if let Some(wait) = wait {
            return ThrottleDecision::RetryAfter(wait);
        }

        state.global.used += 1;
        if self.per_destination.is_some() {
            if let Some(window) = state.destinations.get_mut(&key) {
                window.used += 1;
            }
        }
        ThrottleDecision::Permit(ThrottlePermit { key, granted_at: now })
    }

    /// Returns an unused permit to the windows it was counted in.
    pub async fn refund(&self, permit: ThrottlePermit) {
        let mut state = self.state.lock().await;
        state.global.refund(permit.granted_at);
        if let Some(window) = state.destinations.get_mut(&permit.key) {
            window.refund(permit.granted_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_core::TestClock;

    use super::*;

    fn throttle(max: u32, window_secs: u64) -> (SendThrottle, TestClock) {
        let clock = TestClock::new();
        let limit = WindowLimit::new(max, Duration::from_secs(window_secs));
        (SendThrottle::new(limit, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn global_window_denies_after_max_and_reports_remaining_time() {
        let (throttle, clock) = throttle(2, 30);
        let destination = DestinationId::new("a");

        assert!(throttle.try_acquire(Platform::Twitch, &destination).await.is_permit());
        assert!(throttle.try_acquire(Platform::Twitch, &destination).await.is_permit());

        clock.advance(Duration::from_secs(10));
        assert_eq!(
            throttle.try_acquire(Platform::Twitch, &destination).await,
            ThrottleDecision::RetryAfter(Duration::from_secs(20))
        );
    }

    #[tokio::test]
    async fn window_rollover_restores_permits() {
        let (throttle, clock) = throttle(1, 30);
        let destination = DestinationId::new("a");

        assert!(throttle.try_acquire(Platform::Twitch, &destination).await.is_permit());
        assert!(matches!(
            throttle.try_acquire(Platform::Twitch, &destination).await,
            ThrottleDecision::RetryAfter(_)
        ));

        clock.advance(Duration::from_secs(30));
        assert!(throttle.try_acquire(Platform::Twitch, &destination).await.is_permit());
    }

    #[tokio::test]
    async fn per_destination_denial_does_not_consume_global_budget() {
        let (throttle, _clock) = throttle(2, 30);
        let throttle = throttle.with_per_destination(WindowLimit::new(1, Duration::from_secs(5)));
        let busy = DestinationId::new("busy");
        let quiet = DestinationId::new("quiet");

        assert!(throttle.try_acquire(Platform::Twitch, &busy).await.is_permit());
        assert_eq!(
            throttle.try_acquire(Platform::Twitch, &busy).await,
            ThrottleDecision::RetryAfter(Duration::from_secs(5))
        );
        assert!(throttle.try_acquire(Platform::Twitch, &quiet).await.is_permit());
        assert!(!throttle.try_acquire(Platform::Twitch, &quiet).await.is_permit());
    }

    #[tokio::test]
    async fn one_channel_is_throttled_separately_per_platform() {
        let (throttle, _clock) = throttle(100, 30);
        let throttle = throttle.with_per_destination(WindowLimit::new(1, Duration::from_secs(5)));
        let channel = DestinationId::new("chan-1");

        assert!(throttle.try_acquire(Platform::Twitch, &channel).await.is_permit());
        assert!(throttle.try_acquire(Platform::Youtube, &channel).await.is_permit());
        assert!(!throttle.try_acquire(Platform::Twitch, &channel).await.is_permit());
        assert!(!throttle.try_acquire(Platform::Youtube, &channel).await.is_permit());
    }

    #[tokio::test]
    async fn refunded_permit_can_be_granted_again() {
        let (throttle, _clock) = throttle(1, 30);
        let throttle = throttle.with_per_destination(WindowLimit::new(1, Duration::from_secs(30)));
        let destination = DestinationId::new("a");

        let ThrottleDecision::Permit(permit) =
            throttle.try_acquire(Platform::Kick, &destination).await
        else {
            panic!("first request should be granted");
        };
        assert!(!throttle.try_acquire(Platform::Kick, &destination).await.is_permit());

        throttle.refund(permit).await;
        assert!(throttle.try_acquire(Platform::Kick, &destination).await.is_permit());
    }

    #[tokio::test]
    async fn refund_after_rollover_does_not_inflate_the_new_window() {
        let (throttle, clock) = throttle(1, 30);
        let destination = DestinationId::new("a");

        let ThrottleDecision::Permit(stale) =
            throttle.try_acquire(Platform::Kick, &destination).await
        else {
            panic!("first request should be granted");
        };
        clock.advance(Duration::from_secs(30));
        assert!(throttle.try_acquire(Platform::Kick, &destination).await.is_permit());

        throttle.refund(stale).await;
        assert!(!throttle.try_acquire(Platform::Kick, &destination).await.is_permit());
    }
}
