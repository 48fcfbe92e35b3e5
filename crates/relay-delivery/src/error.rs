//! Error types for outbox delivery operations.
//!
//! Separates three kinds of outcome:
//!
//! - [`SendError`]: a platform adapter failed to transmit. Always recorded on
//!   the row as an attempt and retried with backoff until attempts run out.
//! - [`Deferral`]: the job cannot proceed right now (destination not ready,
//!   channel lock held, throttle window full). Not an error and not an
//!   attempt; the job is simply rescheduled.
//! - [`DeliveryError`]: everything else. Internal failures such as an
//!   unreachable store propagate to the job broker's own failure handling.

use std::{fmt, time::Duration};

use relay_core::{events::DeferralReason, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure reported by a platform send adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network or provider failure that may succeed on a later attempt.
    #[error("transient send failure: {message}")]
    Transient {
        /// Adapter-provided description
        message: String,
    },

    /// Platform refused the message.
    ///
    /// The engine does not validate content, so rejections are retried like
    /// transient failures until attempts are exhausted.
    #[error("platform rejected message: {message}")]
    Rejected {
        /// Adapter-provided description
        message: String,
    },
}

impl SendError {
    /// Creates a transient send error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into() }
    }
}

/// Error types for delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Platform adapter failed to send.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Message reached its attempt limit.
    #[error("delivery failed after {attempts} attempts")]
    AttemptsExhausted {
        /// Attempts recorded on the row
        attempts: u32,
    },

    /// Outbox store operation failed.
    #[error("outbox store error: {message}")]
    Store {
        /// Store error message
        message: String,
    },

    /// Channel lock backend failed.
    #[error("channel lock error: {message}")]
    Lock {
        /// Lock backend error message
        message: String,
    },

    /// Destination directory could not produce a snapshot.
    #[error("destination directory error: {message}")]
    Directory {
        /// Directory error message
        message: String,
    },

    /// Invalid engine configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A spawned task panicked.
    #[error("{task} panicked: {error}")]
    WorkerPanic {
        /// Which task panicked
        task: String,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock { message: message.into() }
    }

    /// Creates a directory error.
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this error belongs to the message itself rather than to the
    /// relay's infrastructure.
    ///
    /// Business errors are recorded on the row and never reach the broker.
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Send(_) | Self::AttemptsExhausted { .. })
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::Store { message: err.to_string() }
    }
}

/// Category of delivery error for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Adapter send failures.
    Send,
    /// Exhausted attempts.
    Exhausted,
    /// Store, lock, or directory backends.
    Infrastructure,
    /// Configuration problems.
    Configuration,
    /// Shutdown, panics, and other internal failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Send(_) => Self::Send,
            DeliveryError::AttemptsExhausted { .. } => Self::Exhausted,
            DeliveryError::Store { .. }
            | DeliveryError::Lock { .. }
            | DeliveryError::Directory { .. } => Self::Infrastructure,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A job postponed without consuming an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    /// Why the job could not proceed.
    pub reason: DeferralReason,
    /// How long to wait before evaluating the job again.
    pub delay: Duration,
}

impl Deferral {
    /// Destination absent from the snapshot or adapter not ready.
    pub fn channel_not_ready(delay: Duration) -> Self {
        Self { reason: DeferralReason::ChannelNotReady, delay }
    }

    /// Channel lock held by another worker.
    pub fn lock_unavailable(delay: Duration) -> Self {
        Self { reason: DeferralReason::LockUnavailable, delay }
    }

    /// Throttle window exhausted.
    pub fn throttled(delay: Duration) -> Self {
        Self { reason: DeferralReason::Throttled, delay }
    }

    /// Row held by a live claim.
    pub fn claim_in_flight(delay: Duration) -> Self {
        Self { reason: DeferralReason::ClaimInFlight, delay }
    }

    /// Message still inside its backoff window.
    pub fn backoff_pending(delay: Duration) -> Self {
        Self { reason: DeferralReason::BackoffPending, delay }
    }
}
