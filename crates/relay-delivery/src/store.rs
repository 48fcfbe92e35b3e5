//! Outbox store abstraction for the delivery engine.
//!
//! The engine mutates rows only through [`OutboxStore`], whose operations are
//! all conditional: claims succeed only on claimable rows and finalization
//! never leaves a terminal state. The production implementation wraps the
//! Postgres repositories of `relay_core::storage`; [`memory`] provides a
//! single-process implementation with identical semantics.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use relay_core::{
    error::Result,
    models::{
        DeadLetter, DestinationId, MessageId, MessageStatus, NewOutboxMessage, OutboxMessage,
        Platform,
    },
    storage::Storage,
    Clock,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable record of pending, in-flight, and terminal outbox messages.
///
/// Implementations read "now" from their injected clock so claim and
/// finalization timestamps follow the same time source as the engine.
pub trait OutboxStore: Send + Sync + 'static {
    /// Persists a new pending message. Entry point for upstream producers.
    fn insert(&self, message: NewOutboxMessage) -> StoreFuture<'_, OutboxMessage>;

    /// Loads a message by id.
    fn find(&self, id: MessageId) -> StoreFuture<'_, Option<OutboxMessage>>;

    /// Atomically claims up to `limit` claimable rows for the given
    /// destinations of `platform`, oldest first.
    ///
    /// Claimed rows move to `processing` with a fresh `processing_at`. Rows
    /// already processing are included only when their claim predates
    /// `stale_before`. A destination whose oldest open row is still inside
    /// its retry backoff contributes no rows.
    fn claim_batch(
        &self,
        platform: Platform,
        destinations: Vec<DestinationId>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<OutboxMessage>>;

    /// Claims a single row. Returns `false` if another worker won, the row
    /// is terminal, or its retry backoff has not elapsed.
    fn claim_single(&self, id: MessageId, stale_before: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Marks a row sent and clears its last error. No-op on terminal rows.
    fn finalize_sent(&self, id: MessageId) -> StoreFuture<'_, bool>;

    /// Returns a row to `pending` with the new attempt count and error. The
    /// row is not claimable again before `retry_at`. No-op on terminal rows.
    fn finalize_retry(
        &self,
        id: MessageId,
        next_attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Marks a row permanently failed and records its dead letter.
    ///
    /// Returns `None` when the row was already terminal.
    fn finalize_failed(
        &self,
        id: MessageId,
        next_attempts: u32,
        error: String,
    ) -> StoreFuture<'_, Option<DeadLetter>>;

    /// Hands a claimed row back to `pending` without touching `attempts`.
    fn release_claim(&self, id: MessageId) -> StoreFuture<'_, bool>;

    /// Lists ids of claimable rows that are due now, oldest first, without
    /// claiming them.
    fn list_claimable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<MessageId>>;

    /// Counts rows in a status.
    fn count_by_status(&self, status: MessageStatus) -> StoreFuture<'_, u64>;
}

/// Production store backed by Postgres.
pub struct PostgresOutboxStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresOutboxStore {
    /// Creates a store over the shared repositories.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn insert(&self, message: NewOutboxMessage) -> StoreFuture<'_, OutboxMessage> {
        Box::pin(async move {
            let message = message.into_message(self.clock.now_utc());
            self.storage.outbox_messages.insert(&message).await?;
            Ok(message)
        })
    }

    fn find(&self, id: MessageId) -> StoreFuture<'_, Option<OutboxMessage>> {
        Box::pin(async move { self.storage.outbox_messages.find(id).await })
    }

    fn claim_batch(
        &self,
        platform: Platform,
        destinations: Vec<DestinationId>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<OutboxMessage>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage
                .outbox_messages
                .claim_batch(platform, &destinations, stale_before, now, limit)
                .await
        })
    }

    fn claim_single(&self, id: MessageId, stale_before: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage.outbox_messages.claim_single(id, stale_before, now).await
        })
    }

    fn finalize_sent(&self, id: MessageId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage.outbox_messages.mark_sent(id, now).await
        })
    }

    fn finalize_retry(
        &self,
        id: MessageId,
        next_attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.storage.outbox_messages.mark_retry(id, next_attempts, &error, retry_at).await
        })
    }

    fn finalize_failed(
        &self,
        id: MessageId,
        next_attempts: u32,
        error: String,
    ) -> StoreFuture<'_, Option<DeadLetter>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut tx = self.storage.outbox_messages.pool().begin().await?;

            let Some(failed) = self
                .storage
                .outbox_messages
                .mark_failed_in_tx(&mut tx, id, next_attempts, &error, now)
                .await?
            else {
                tx.rollback().await?;
                return Ok(None);
            };

            let dead_letter = DeadLetter {
                message_id: failed.id,
                platform: failed.platform,
                internal_destination_id: failed.internal_destination_id,
                attempts: failed.attempts,
                last_error: failed.last_error,
                failed_at: now,
            };
            self.storage.dead_letters.insert_in_tx(&mut tx, &dead_letter).await?;
            tx.commit().await?;

            Ok(Some(dead_letter))
        })
    }

    fn release_claim(&self, id: MessageId) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.outbox_messages.release_claim(id).await })
    }

    fn list_claimable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<MessageId>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage.outbox_messages.list_claimable(stale_before, now, limit).await
        })
    }

    fn count_by_status(&self, status: MessageStatus) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.storage.outbox_messages.count_by_status(status).await })
    }
}

pub mod memory {
    //! In-memory outbox store.
    //!
    //! Holds every row behind a single lock so each operation is atomic with
    //! respect to the others, which gives the same winner-takes-all claim
    //! semantics as the conditional updates in Postgres. Suitable for
    //! single-process deployments and for tests.

    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use relay_core::{
        error::{CoreError, Result},
        models::{
            DeadLetter, DestinationId, MessageId, MessageStatus, NewOutboxMessage, OutboxMessage,
            Platform,
        },
        Clock,
    };
    use tokio::sync::RwLock;

    use super::{OutboxStore, StoreFuture};

    #[derive(Default)]
    struct State {
        messages: HashMap<MessageId, OutboxMessage>,
        dead_letters: HashMap<MessageId, DeadLetter>,
        claim_errors: VecDeque<String>,
    }

    impl State {
        fn take_claim_error(&mut self) -> Result<()> {
            match self.claim_errors.pop_front() {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    /// Outbox store keeping all rows in process memory.
    #[derive(Clone)]
    pub struct InMemoryOutboxStore {
        state: Arc<RwLock<State>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryOutboxStore {
        /// Creates an empty store.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), clock }
        }

        /// Writes a row exactly as given, replacing any row with the same id.
        ///
        /// Lets tests reproduce states the engine would not produce on its
        /// own, such as a claim left behind by a crashed worker.
        pub async fn seed(&self, message: OutboxMessage) {
            self.state.write().await.messages.insert(message.id, message);
        }

        /// Returns every row, oldest first.
        pub async fn all_messages(&self) -> Vec<OutboxMessage> {
            let mut messages: Vec<_> = self.state.read().await.messages.values().cloned().collect();
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            messages
        }

        /// Returns recorded dead letters.
        pub async fn dead_letters(&self) -> Vec<DeadLetter> {
            self.state.read().await.dead_letters.values().cloned().collect()
        }

        /// Makes the next claim operation fail with a database error.
        pub async fn inject_claim_error(&self, message: impl Into<String>) {
            self.state.write().await.claim_errors.push_back(message.into());
        }
    }

    impl OutboxStore for InMemoryOutboxStore {
        fn insert(&self, message: NewOutboxMessage) -> StoreFuture<'_, OutboxMessage> {
            Box::pin(async move {
                let message = message.into_message(self.clock.now_utc());
                let mut state = self.state.write().await;
                if state.messages.contains_key(&message.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "outbox message {} already exists",
                        message.id
                    )));
                }
                state.messages.insert(message.id, message.clone());
                Ok(message)
            })
        }

        fn find(&self, id: MessageId) -> StoreFuture<'_, Option<OutboxMessage>> {
            Box::pin(async move { Ok(self.state.read().await.messages.get(&id).cloned()) })
        }

        fn claim_batch(
            &self,
            platform: Platform,
            destinations: Vec<DestinationId>,
            stale_before: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<OutboxMessage>> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.write().await;
                state.take_claim_error()?;

                let in_scope = |m: &OutboxMessage| {
                    m.platform == platform && destinations.contains(&m.internal_destination_id)
                };

                // Oldest row per destination still waiting out its backoff.
                let mut held_from: HashMap<&DestinationId, DateTime<Utc>> = HashMap::new();
                for m in state.messages.values() {
                    if in_scope(m) && !m.is_terminal() && !m.is_due(now) {
                        held_from
                            .entry(&m.internal_destination_id)
                            .and_modify(|from| *from = (*from).min(m.created_at))
                            .or_insert(m.created_at);
                    }
                }

                let mut candidates: Vec<&OutboxMessage> = state
                    .messages
                    .values()
                    .filter(|m| in_scope(m))
                    .filter(|m| m.is_claimable(stale_before))
                    .filter(|m| {
                        held_from
                            .get(&m.internal_destination_id)
                            .map_or(true, |from| m.created_at < *from)
                    })
                    .collect();
                candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                let ids: Vec<MessageId> = candidates.iter().take(limit).map(|m| m.id).collect();

                let mut claimed = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(message) = state.messages.get_mut(&id) {
                        message.status = MessageStatus::Processing;
                        message.processing_at = Some(now);
                        claimed.push(message.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn claim_single(
            &self,
            id: MessageId,
            stale_before: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.write().await;
                state.take_claim_error()?;

                match state.messages.get_mut(&id) {
                    Some(message) if message.is_claimable(stale_before) && message.is_due(now) => {
                        message.status = MessageStatus::Processing;
                        message.processing_at = Some(now);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn finalize_sent(&self, id: MessageId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.write().await;
                match state.messages.get_mut(&id) {
                    Some(message) if !message.is_terminal() => {
                        message.status = MessageStatus::Sent;
                        message.sent_at = Some(now);
                        message.last_error = None;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn finalize_retry(
            &self,
            id: MessageId,
            next_attempts: u32,
            error: String,
            retry_at: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.messages.get_mut(&id) {
                    Some(message) if !message.is_terminal() => {
                        message.status = MessageStatus::Pending;
                        message.attempts = message.attempts.max(next_attempts);
                        message.last_error = Some(error);
                        message.next_attempt_at = Some(retry_at);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn finalize_failed(
            &self,
            id: MessageId,
            next_attempts: u32,
            error: String,
        ) -> StoreFuture<'_, Option<DeadLetter>> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.write().await;
                let dead_letter = match state.messages.get_mut(&id) {
                    Some(message) if !message.is_terminal() => {
                        message.status = MessageStatus::Failed;
                        message.attempts = message.attempts.max(next_attempts);
                        message.last_error = Some(error);
                        message.failed_at = Some(now);
                        DeadLetter {
                            message_id: message.id,
                            platform: message.platform,
                            internal_destination_id: message.internal_destination_id.clone(),
                            attempts: message.attempts,
                            last_error: message.last_error.clone(),
                            failed_at: now,
                        }
                    },
                    _ => return Ok(None),
                };
                state.dead_letters.entry(id).or_insert_with(|| dead_letter.clone());
                Ok(Some(dead_letter))
            })
        }

        fn release_claim(&self, id: MessageId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.messages.get_mut(&id) {
                    Some(message) if message.status == MessageStatus::Processing => {
                        message.status = MessageStatus::Pending;
                        message.processing_at = None;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn list_claimable(
            &self,
            stale_before: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<MessageId>> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let state = self.state.read().await;
                let mut claimable: Vec<&OutboxMessage> = state
                    .messages
                    .values()
                    .filter(|m| m.is_claimable(stale_before) && m.is_due(now))
                    .collect();
                claimable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(claimable.into_iter().take(limit).map(|m| m.id).collect())
            })
        }

        fn count_by_status(&self, status: MessageStatus) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.messages.values().filter(|m| m.status == status).count() as u64)
            })
        }
    }

}
