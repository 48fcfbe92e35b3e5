//! Outbox delivery engine for chat messages.
//!
//! Takes durably stored outgoing messages and delivers them to live-streaming
//! chat destinations at least once, in order per destination, with no two
//! sends to one destination in flight at the same time.
//!
//! # Architecture
//!
//! Two interchangeable execution strategies share one send/finalize path:
//!
//! 1. **Broker jobs** - one job per message on an in-process scheduler with
//!    bounded parallelism. Each run checks readiness, throttle, and the
//!    per-destination channel lock before claiming and sending.
//! 2. **Poll loop** - a single-process fallback claiming batches on a fixed
//!    interval and draining them per destination without locks.
//!
//! # Key Features
//!
//! - **Conditional claims** - rows move only through guarded updates, so
//!   concurrent workers never both claim a row
//! - **Channel locks** - leased, owner-fenced mutual exclusion per destination
//! - **Deterministic backoff** - retry delays seeded by the message id
//! - **Stale-claim recovery** - rows abandoned by a crashed worker become
//!   claimable again after a threshold
//! - **Graceful shutdown** - in-flight sends complete before exit
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_core::{models::Platform, RealClock};
//! use relay_delivery::{
//!     adapter::{AdapterRegistry, LoggingSendAdapter, StaticDestinationDirectory},
//!     lock::InMemoryChannelLock,
//!     store::memory::InMemoryOutboxStore,
//!     DeliveryConfig, DeliveryEngine, DeliveryError, EngineComponents,
//! };
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let components = EngineComponents {
//!     store: Arc::new(InMemoryOutboxStore::new(clock.clone())),
//!     lock: Arc::new(InMemoryChannelLock::new(clock.clone())),
//!     directory: Arc::new(StaticDestinationDirectory::new(clock.clone())),
//!     adapters: AdapterRegistry::new()
//!         .with_adapter(Platform::Twitch, Arc::new(LoggingSendAdapter::new(Platform::Twitch))),
//! };
//!
//! let mut engine = DeliveryEngine::new(DeliveryConfig::default(), components, clock)?;
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod adapter;
pub mod backoff;
pub mod broker;
pub mod engine;
pub mod error;
mod job;
pub mod lock;
mod poller;
pub mod store;
pub mod throttle;
mod worker;

// Re-export main public API
pub use backoff::BackoffPolicy;
pub use broker::JobOutcome;
pub use engine::{DeliveryConfig, DeliveryEngine, EngineComponents, EngineStats};
pub use error::{DeliveryError, Result, SendError};
pub use poller::TickReport;
pub use throttle::WindowLimit;

/// Default number of concurrently running broker jobs.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Default number of rows claimed per poll tick.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default age after which a processing claim is considered abandoned.
pub const DEFAULT_STALE_PROCESSING: Duration = Duration::from_secs(60);
