//! Deterministic exponential backoff.
//!
//! The delay for a given attempt of a given message is a pure function of
//! `(attempt, seed)`, where the seed is derived from the message id. Any
//! process evaluating the same attempt of the same message arrives at the
//! same delay, so a broker's retry timer and the worker's own bookkeeping can
//! never disagree.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use relay_core::models::MessageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Largest exponent applied to the base delay. `2^30` times any sane base
/// already exceeds every practical cap.
const MAX_EXPONENT: u32 = 30;

/// Backoff configuration.
///
/// Produces a delay in `[base * 2^attempt, base * 2^attempt * jitter_factor)`.
/// A `jitter_factor` of 1.0 or less collapses the range to its lower bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay multiplied by `2^attempt`.
    pub base_delay: Duration,

    /// Upper bound multiplier of the jitter range.
    pub jitter_factor: f64,

    /// Cap applied after jitter.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(1), jitter_factor: 1.5, max_delay: None }
    }
}

impl BackoffPolicy {
    /// Creates a policy without a cap.
    pub fn new(base_delay: Duration, jitter_factor: f64) -> Self {
        Self { base_delay, jitter_factor, max_delay: None }
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Computes the delay before `attempt` for the given seed.
    pub fn compute(&self, attempt: u32, seed: u64) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let lower_ms = base_ms.saturating_mul(1_u64 << exponent);

        let delay_ms = if self.jitter_factor > 1.0 && lower_ms > 0 {
            let upper = (lower_ms as f64 * self.jitter_factor).min(u64::MAX as f64);
            let upper_ms = upper as u64;
            if upper_ms > lower_ms {
                let mut rng = StdRng::seed_from_u64(seed);
                rng.random_range(lower_ms..upper_ms)
            } else {
                lower_ms
            }
        } else {
            lower_ms
        };

        let delay = Duration::from_millis(delay_ms);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Computes the delay before `attempt` of `message_id`.
    pub fn compute_for(&self, attempt: u32, message_id: MessageId) -> Duration {
        self.compute(attempt, seed_for(message_id))
    }
}

/// Derives the stable backoff seed of a message.
///
/// First eight bytes of the SHA-256 digest of the id, big-endian.
pub fn seed_for(message_id: MessageId) -> u64 {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
