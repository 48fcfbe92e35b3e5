//! Time abstractions for deterministic scheduling and expiry.
//!
//! Every timestamp the relay writes (claims, finalization, lock expiry) and
//! every window it measures (throttle, backoff gate) is read from an injected
//! [`Clock`], so stale-claim recovery and lock TTLs can be tested without
//! waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject a `TestClock` and move time
/// forward explicitly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`; test clocks may
    /// advance virtual time instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Returns the current system time as a UTC timestamp for persistence.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Real clock implementation using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to the engine can
/// be advanced from the test body. Monotonic and system time move together on
/// [`advance`](Self::advance); system time alone may jump backwards through
/// [`jump_to`](Self::jump_to).
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since creation
    monotonic_ns: Arc<AtomicU64>,
    /// System time as nanoseconds since UNIX_EPOCH
    system_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a new test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = saturating_nanos(duration);
        self.monotonic_ns.fetch_add(duration_ns, Ordering::AcqRel);
        self.system_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Jumps the clock to a specific system time.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = saturating_nanos(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.system_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            // monotonic time never moves backwards
            self.system_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Returns elapsed monotonic time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
