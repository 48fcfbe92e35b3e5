//! Core domain models and event types.
//!
//! Provides strongly-typed domain primitives, the outbox message lifecycle,
//! delivery events, an injectable clock, and the Postgres repositories that
//! back the outbox relay. The delivery engine and the service binary depend on
//! these foundational types for type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeadLetteredEvent, DeliveryEvent, DeliveryRetriedEvent, DeliverySentEvent, DeferralReason,
    DeliveryDeferredEvent, EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    DeadLetter, DestinationId, DestinationInfo, LockKey, MessageId, MessageStatus,
    NewOutboxMessage, OutboxMessage, OwnerToken, Platform,
};
pub use time::{Clock, RealClock, TestClock};
