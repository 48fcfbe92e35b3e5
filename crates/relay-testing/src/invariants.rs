//! Invariant checking and property-based testing utilities.
//!
//! Checks operate on row snapshots such as those returned by
//! `InMemoryOutboxStore::all_messages`, so a test can compare the store
//! before and after any step.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use relay_core::models::{MessageId, MessageStatus, OutboxMessage};

/// Outbox invariants that must hold after every engine step.
pub struct Invariants;

impl Invariants {
    /// Terminal rows never change status or attempts again.
    pub fn terminal_rows_stable(before: &[OutboxMessage], after: &[OutboxMessage]) -> Result<()> {
        let after: HashMap<MessageId, &OutboxMessage> = after.iter().map(|m| (m.id, m)).collect();
        for old in before.iter().filter(|m| m.is_terminal()) {
            let Some(new) = after.get(&old.id) else {
                anyhow::bail!("terminal message {} disappeared", old.id);
            };
            ensure!(
                new.status == old.status,
                "terminal message {} moved from {} to {}",
                old.id,
                old.status,
                new.status
            );
            ensure!(
                new.attempts == old.attempts,
                "terminal message {} attempts changed: {} -> {}",
                old.id,
                old.attempts,
                new.attempts
            );
        }
        Ok(())
    }

    /// Attempts never decrease.
    pub fn attempts_monotonic(before: &[OutboxMessage], after: &[OutboxMessage]) -> Result<()> {
        let after: HashMap<MessageId, &OutboxMessage> = after.iter().map(|m| (m.id, m)).collect();
        for old in before {
            if let Some(new) = after.get(&old.id) {
                ensure!(
                    new.attempts >= old.attempts,
                    "message {} attempts decreased: {} -> {}",
                    old.id,
                    old.attempts,
                    new.attempts
                );
            }
        }
        Ok(())
    }

    /// Attempts stay within the configured maximum.
    pub fn attempts_bounded(messages: &[OutboxMessage], max_attempts: u32) -> Result<()> {
        for message in messages {
            ensure!(
                message.attempts <= max_attempts,
                "message {} exceeded max attempts: {} > {}",
                message.id,
                message.attempts,
                max_attempts
            );
        }
        Ok(())
    }

    /// Terminal timestamps and diagnostics match the status.
    pub fn terminal_fields_consistent(messages: &[OutboxMessage]) -> Result<()> {
        for message in messages {
            match message.status {
                MessageStatus::Sent => {
                    ensure!(
                        message.sent_at.is_some(),
                        "sent message {} has no sent_at",
                        message.id
                    );
                    ensure!(
                        message.failed_at.is_none(),
                        "sent message {} also has failed_at",
                        message.id
                    );
                },
                MessageStatus::Failed => {
                    ensure!(
                        message.failed_at.is_some(),
                        "failed message {} has no failed_at",
                        message.id
                    );
                    ensure!(
                        message.last_error.is_some(),
                        "failed message {} has no last_error",
                        message.id
                    );
                    ensure!(
                        message.sent_at.is_none(),
                        "failed message {} also has sent_at",
                        message.id
                    );
                },
                MessageStatus::Pending | MessageStatus::Processing => {
                    ensure!(
                        message.sent_at.is_none() && message.failed_at.is_none(),
                        "non-terminal message {} carries a terminal timestamp",
                        message.id
                    );
                },
            }
        }
        Ok(())
    }

    /// Runs every single-snapshot check.
    pub fn check_all(messages: &[OutboxMessage], max_attempts: u32) -> Result<()> {
        Self::attempts_bounded(messages, max_attempts)?;
        Self::terminal_fields_consistent(messages)
    }

    /// Runs every before/after check.
    pub fn check_transition(before: &[OutboxMessage], after: &[OutboxMessage]) -> Result<()> {
        Self::terminal_rows_stable(before, after)?;
        Self::attempts_monotonic(before, after)
    }

    /// No destination ever saw more than one send in flight.
    pub fn sends_serialized(max_concurrent_per_destination: usize) -> Result<()> {
        ensure!(
            max_concurrent_per_destination <= 1,
            "observed {max_concurrent_per_destination} overlapping sends to one destination"
        );
        Ok(())
    }
}

/// Proptest strategies for delivery scenarios.
pub mod strategies {
    use proptest::prelude::*;

    /// A scripted sequence of send outcomes, `true` meaning success.
    pub fn send_script(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..=max_len)
    }

    /// Destination names drawn from a small pool so collisions are common.
    pub fn destination_name() -> impl Strategy<Value = String> {
        (0u8..4).prop_map(|n| format!("chan-{n}"))
    }

    /// Attempt budgets worth exploring.
    pub fn max_attempts() -> impl Strategy<Value = u32> {
        1u32..=6
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::fixtures::MessageBuilder;

    #[test]
    fn sent_row_without_timestamp_is_flagged() {
        let mut message = MessageBuilder::new().build().into_message(Utc::now());
        message.status = MessageStatus::Sent;
        assert!(Invariants::terminal_fields_consistent(&[message.clone()]).is_err());

        message.sent_at = Some(Utc::now());
        assert!(Invariants::terminal_fields_consistent(&[message]).is_ok());
    }

    #[test]
    fn reopened_terminal_row_is_flagged() {
        let mut before = MessageBuilder::new().build().into_message(Utc::now());
        before.status = MessageStatus::Failed;
        before.attempts = 3;
        let mut after = before.clone();
        after.status = MessageStatus::Pending;

        assert!(Invariants::terminal_rows_stable(&[before], &[after]).is_err());
    }

    #[test]
    fn decreasing_attempts_are_flagged() {
        let mut before = MessageBuilder::new().build().into_message(Utc::now());
        before.attempts = 2;
        let mut after = before.clone();
        after.attempts = 1;

        assert!(Invariants::attempts_monotonic(&[before], &[after]).is_err());
    }
}
