//! Repository for permanently failed messages.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use super::attempts_to_db;
use crate::{
    error::Result,
    models::{DeadLetter, MessageId},
};

/// Repository for dead letter records.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a dead letter within the transaction that failed the message.
    ///
    /// Recording the same message twice keeps the first record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dead_letter: &DeadLetter,
    ) -> Result<()> {
        self.insert_impl(&mut **tx, dead_letter).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, dead_letter: &DeadLetter) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO outbox_dead_letters (
                message_id, platform, internal_destination_id, attempts, last_error, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(dead_letter.message_id)
        .bind(dead_letter.platform.as_str())
        .bind(&dead_letter.internal_destination_id)
        .bind(attempts_to_db(dead_letter.attempts))
        .bind(&dead_letter.last_error)
        .bind(dead_letter.failed_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds the dead letter for a message.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, message_id: MessageId) -> Result<Option<DeadLetter>> {
        let dead_letter = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT message_id, platform, internal_destination_id, attempts, last_error, failed_at
            FROM outbox_dead_letters
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(dead_letter)
    }

    /// Lists the most recent dead letters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let dead_letters = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT message_id, platform, internal_destination_id, attempts, last_error, failed_at
            FROM outbox_dead_letters
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(dead_letters)
    }
}
