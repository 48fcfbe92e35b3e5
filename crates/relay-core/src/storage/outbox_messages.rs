//! Repository for outbox message lifecycle operations.
//!
//! Claims use conditional updates so that exactly one contender wins each
//! row. Finalization never touches rows that already reached `sent` or
//! `failed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use super::attempts_to_db;
use crate::{
    error::Result,
    models::{DestinationId, MessageId, MessageStatus, OutboxMessage, Platform},
};

/// Repository for outbox message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new outbox message.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the id already exists.
    pub async fn insert(&self, message: &OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, platform, internal_destination_id, external_destination_id,
                payload_text, status, attempts, last_error, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(message.id)
        .bind(message.platform.as_str())
        .bind(&message.internal_destination_id)
        .bind(&message.external_destination_id)
        .bind(&message.payload_text)
        .bind(message.status.to_string())
        .bind(attempts_to_db(message.attempts))
        .bind(&message.last_error)
        .bind(message.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let message = sqlx::query_as::<_, OutboxMessage>(
            r#"
            SELECT id, platform, internal_destination_id, external_destination_id,
                   payload_text, status, attempts, last_error, created_at,
                   processing_at, sent_at, failed_at, next_attempt_at
            FROM outbox_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Claims up to `limit` claimable rows for the given destinations of one
    /// platform.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent pollers claim disjoint
    /// rows without blocking each other. A row is skipped while any row of
    /// its destination created at or before it is still waiting out a retry
    /// backoff, so a destination never skips ahead of its head of line.
    /// Returned rows are ordered oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_batch(
        &self,
        platform: Platform,
        destinations: &[DestinationId],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        if destinations.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let destination_ids: Vec<String> = destinations.iter().map(|d| d.0.clone()).collect();

        let mut claimed = sqlx::query_as::<_, OutboxMessage>(
            r#"
            UPDATE outbox_messages
            SET status = 'processing', processing_at = $4
            WHERE id IN (
                SELECT m.id FROM outbox_messages m
                WHERE m.platform = $5
                  AND m.internal_destination_id = ANY($1)
                  AND (m.status = 'pending'
                       OR (m.status = 'processing' AND m.processing_at < $2))
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_messages held
                      WHERE held.platform = m.platform
                        AND held.internal_destination_id = m.internal_destination_id
                        AND held.status IN ('pending', 'processing')
                        AND held.next_attempt_at > $4
                        AND held.created_at <= m.created_at
                  )
                ORDER BY m.created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, platform, internal_destination_id, external_destination_id,
                      payload_text, status, attempts, last_error, created_at,
                      processing_at, sent_at, failed_at, next_attempt_at
            "#,
        )
        .bind(&destination_ids)
        .bind(stale_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .bind(platform.as_str())
        .fetch_all(&*self.pool)
        .await?;

        // RETURNING does not preserve the sub-select order
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    /// Claims one row if it is pending or its claim is stale, and its retry
    /// backoff has elapsed.
    ///
    /// Returns `false` when the row was claimed by someone else, is terminal,
    /// is not due yet, or does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_single(
        &self,
        id: MessageId,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'processing', processing_at = $3
            WHERE id = $1
              AND (status = 'pending'
                   OR (status = 'processing' AND processing_at < $2))
              AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a message as sent. No-op on terminal rows.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'sent', sent_at = $2, last_error = NULL
            WHERE id = $1 AND status NOT IN ('sent', 'failed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns a message to `pending` after a failed attempt, not to be
    /// claimed again before `retry_at`.
    ///
    /// The attempt counter never decreases even if an overlapping run
    /// recorded a higher value first.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_retry(
        &self,
        id: MessageId,
        attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', attempts = GREATEST(attempts, $2), last_error = $3,
                next_attempt_at = $4
            WHERE id = $1 AND status NOT IN ('sent', 'failed')
            "#,
        )
        .bind(id)
        .bind(attempts_to_db(attempts))
        .bind(error)
        .bind(retry_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a message as permanently failed within a transaction.
    ///
    /// Returns the updated row, or `None` if the row was already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: MessageId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxMessage>> {
        self.mark_failed_impl(&mut **tx, id, attempts, error, now).await
    }

    async fn mark_failed_impl<'e, E>(
        &self,
        executor: E,
        id: MessageId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxMessage>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let message = sqlx::query_as::<_, OutboxMessage>(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', attempts = GREATEST(attempts, $2),
                last_error = $3, failed_at = $4
            WHERE id = $1 AND status NOT IN ('sent', 'failed')
            RETURNING id, platform, internal_destination_id, external_destination_id,
                      payload_text, status, attempts, last_error, created_at,
                      processing_at, sent_at, failed_at, next_attempt_at
            "#,
        )
        .bind(id)
        .bind(attempts_to_db(attempts))
        .bind(error)
        .bind(now)
        .fetch_optional(executor)
        .await?;

        Ok(message)
    }

    /// Hands a claimed row back to `pending` without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_claim(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', processing_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists ids of claimable rows that are due at `now`, oldest first,
    /// without claiming them.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_claimable(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>> {
        let ids = sqlx::query_scalar::<_, MessageId>(
            r#"
            SELECT id FROM outbox_messages
            WHERE (status = 'pending'
                   OR (status = 'processing' AND processing_at < $1))
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Counts messages in the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: MessageStatus) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages WHERE status = $1")
                .bind(status.to_string())
                .fetch_one(&*self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
