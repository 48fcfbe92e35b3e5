//! Per-destination channel locks.
//!
//! A channel lock guarantees at most one in-flight send per destination
//! across every worker that shares the lock backend. Locks are leases: each
//! expires after its TTL so a crashed holder cannot wedge a destination, and
//! release is owner-checked so a holder whose lease already lapsed cannot
//! free a lock that has since been granted to someone else.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use relay_core::{
    models::{DestinationId, LockKey, OwnerToken, Platform},
    storage::Storage,
    Clock,
};
use tokio::sync::Mutex;

use crate::error::{DeliveryError, Result};

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    /// Whether the caller now holds the lock.
    pub acquired: bool,
    /// Key of the lock, needed for release.
    pub key: LockKey,
}

/// Distributed mutual exclusion keyed by destination.
#[async_trait]
pub trait ChannelLock: Send + Sync {
    /// Tries to take the lock for a destination for `ttl`.
    ///
    /// Never blocks waiting for the current holder.
    async fn acquire(
        &self,
        platform: Platform,
        destination: &DestinationId,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<LockAcquisition>;

    /// Releases the lock if `owner` still holds it. Returns whether a lock
    /// was released.
    async fn release(&self, key: &LockKey, owner: OwnerToken) -> Result<bool>;
}

/// Lock backend stored in the `channel_locks` table.
pub struct PostgresChannelLock {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresChannelLock {
    /// Creates a lock backend over the shared repositories.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

#[async_trait]
impl ChannelLock for PostgresChannelLock {
    async fn acquire(
        &self,
        platform: Platform,
        destination: &DestinationId,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<LockAcquisition> {
        let key = LockKey::for_destination(platform, destination);
        let now = self.clock.now_utc();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DeliveryError::lock(format!("lock ttl out of range: {e}")))?;

        let acquired = self
            .storage
            .channel_locks
            .try_acquire(&key, owner, now, now + ttl)
            .await
            .map_err(|e| DeliveryError::lock(e.to_string()))?;

        Ok(LockAcquisition { acquired, key })
    }

    async fn release(&self, key: &LockKey, owner: OwnerToken) -> Result<bool> {
        self.storage
            .channel_locks
            .release(key, owner)
            .await
            .map_err(|e| DeliveryError::lock(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: OwnerToken,
    expires_at: Instant,
}

/// Lock table held in process memory.
///
/// Only serializes workers within one process. Expiry follows the injected
/// clock.
#[derive(Clone)]
pub struct InMemoryChannelLock {
    leases: Arc<Mutex<HashMap<LockKey, Lease>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryChannelLock {
    /// Creates an empty lock table.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { leases: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Returns the live holder of a lock, if any.
    pub async fn holder(&self, key: &LockKey) -> Option<OwnerToken> {
        let now = self.clock.now();
        self.leases
            .lock()
            .await
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner)
    }
}

#[async_trait]
impl ChannelLock for InMemoryChannelLock {
    async fn acquire(
        &self,
        platform: Platform,
        destination: &DestinationId,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<LockAcquisition> {
        let key = LockKey::for_destination(platform, destination);
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;

        let held = leases.get(&key).is_some_and(|lease| lease.expires_at > now);
        if !held {
            leases.insert(key.clone(), Lease { owner, expires_at: now + ttl });
        }

        Ok(LockAcquisition { acquired: !held, key })
    }

    async fn release(&self, key: &LockKey, owner: OwnerToken) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|lease| lease.owner == owner) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
