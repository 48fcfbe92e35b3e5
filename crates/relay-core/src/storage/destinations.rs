//! Read access to the destination mapping.
//!
//! Rows in `chat_destinations` are written by the subscription-sync process.
//! The relay only reads the active set, except for [`Repository::upsert`]
//! which exists for embedding processes and tests that stand in for sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::DestinationInfo};

/// Repository for destination lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns every active destination.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_active(&self) -> Result<Vec<DestinationInfo>> {
        let destinations = sqlx::query_as::<_, DestinationInfo>(
            r#"
            SELECT internal_id, platform, external_id
            FROM chat_destinations
            WHERE is_active
            ORDER BY platform, internal_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(destinations)
    }

    /// Inserts or updates a destination mapping.
    ///
    /// One internal channel may be mapped on several platforms; each
    /// `(platform, internal_id)` pair is a separate row.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(
        &self,
        destination: &DestinationInfo,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_destinations
                (internal_id, platform, external_id, is_active, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (platform, internal_id) DO UPDATE
                SET external_id = EXCLUDED.external_id,
                    is_active = EXCLUDED.is_active,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&destination.internal_id)
        .bind(destination.platform.as_str())
        .bind(&destination.external_id)
        .bind(is_active)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
