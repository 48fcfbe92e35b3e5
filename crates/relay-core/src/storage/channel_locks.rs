//! Repository for distributed per-destination channel locks.
//!
//! A lock row is a lease: it names its owner and an expiry. Acquisition only
//! overwrites a row whose lease has lapsed, and release only deletes a row
//! the caller still owns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{LockKey, OwnerToken},
};

/// Repository for channel lock operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Attempts to take the lock for `key` until `expires_at`.
    ///
    /// Succeeds when no row exists or the existing lease expired at or before
    /// `now`. A live lease held by anyone, including `owner`, is never
    /// extended.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        key: &LockKey,
        owner: OwnerToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let granted: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO channel_locks (lock_key, owner_token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
                SET owner_token = EXCLUDED.owner_token, expires_at = EXCLUDED.expires_at
                WHERE channel_locks.expires_at <= $4
            RETURNING owner_token
            "#,
        )
        .bind(key.as_str())
        .bind(owner.0)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(granted == Some(owner.0))
    }

    /// Releases the lock if `owner` still holds it.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn release(&self, key: &LockKey, owner: OwnerToken) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM channel_locks WHERE lock_key = $1 AND owner_token = $2",
        )
        .bind(key.as_str())
        .bind(owner.0)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns the current holder and expiry of a lock, expired or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn holder(&self, key: &LockKey) -> Result<Option<(OwnerToken, DateTime<Utc>)>> {
        let row: Option<(uuid::Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT owner_token, expires_at FROM channel_locks WHERE lock_key = $1")
                .bind(key.as_str())
                .fetch_optional(&*self.pool)
                .await?;

        Ok(row.map(|(owner, expires_at)| (OwnerToken(owner), expires_at)))
    }
}
