//! Database access layer for outbox persistence.
//!
//! Repositories translate between domain models and the Postgres schema. All
//! SQL the relay issues lives in this module; the delivery engine only sees
//! the repository methods.
//!
//! Every mutation of `outbox_messages` is a conditional update keyed on the
//! row's current status, so concurrent workers and overlapping job runs can
//! race without corrupting a row: the loser's update simply matches nothing.

use std::sync::Arc;

use sqlx::PgPool;

pub mod channel_locks;
pub mod dead_letters;
pub mod destinations;
pub mod outbox_messages;

use crate::error::Result;

/// Statements creating the relay schema. Idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        id UUID PRIMARY KEY,
        platform TEXT NOT NULL,
        internal_destination_id TEXT NOT NULL,
        external_destination_id TEXT NOT NULL,
        payload_text TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'sent', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        processing_at TIMESTAMPTZ,
        sent_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ
    )
    "#,
    "ALTER TABLE outbox_messages ADD COLUMN IF NOT EXISTS next_attempt_at TIMESTAMPTZ",
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_messages_claimable
        ON outbox_messages (platform, internal_destination_id, created_at)
        WHERE status IN ('pending', 'processing')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS channel_locks (
        lock_key TEXT PRIMARY KEY,
        owner_token UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_dead_letters (
        message_id UUID PRIMARY KEY,
        platform TEXT NOT NULL,
        internal_destination_id TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT,
        failed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_destinations (
        platform TEXT NOT NULL,
        internal_id TEXT NOT NULL,
        external_id TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (platform, internal_id)
    )
    "#,
];

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for outbox message lifecycle operations.
    pub outbox_messages: Arc<outbox_messages::Repository>,

    /// Repository for distributed channel locks.
    pub channel_locks: Arc<channel_locks::Repository>,

    /// Repository for permanently failed messages.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Read access to the destination mapping owned by subscription sync.
    pub destinations: Arc<destinations::Repository>,
}

impl Storage {
    /// Creates a new storage instance sharing one connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            outbox_messages: Arc::new(outbox_messages::Repository::new(pool.clone())),
            channel_locks: Arc::new(channel_locks::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            destinations: Arc::new(destinations::Repository::new(pool)),
        }
    }

    /// Creates tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn bootstrap_schema(&self) -> Result<()> {
        let pool = self.outbox_messages.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }

        tracing::debug!(statements = SCHEMA.len(), "relay schema ensured");
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.outbox_messages.pool()).await?;

        Ok(())
    }
}

/// Converts an attempt counter to the `INTEGER` column type.
pub(crate) fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_from_lazy_pool() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }

    #[test]
    fn attempts_saturate_at_column_limit() {
        assert_eq!(attempts_to_db(3), 3);
        assert_eq!(attempts_to_db(u32::MAX), i32::MAX);
    }
}
