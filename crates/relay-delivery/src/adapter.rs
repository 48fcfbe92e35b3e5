//! Seams to the collaborators the engine consumes but does not own.
//!
//! - [`PlatformSendAdapter`]: the platform-specific transmit call and its
//!   readiness check. One adapter per [`Platform`], held in an
//!   [`AdapterRegistry`].
//! - [`DestinationDirectory`]: the subscription-sync view of which
//!   destinations are active. The engine reads it as an immutable
//!   [`DestinationSnapshot`] taken at the start of each evaluation so it never
//!   acts on a half-updated mapping.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    models::{DestinationId, DestinationInfo, Platform},
    storage::Storage,
    Clock,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{DeliveryError, Result, SendError};

/// Per-platform primitives for delivering a chat message.
///
/// `send` may be invoked more than once for the same logical message; the
/// engine minimizes duplicates but cannot rule them out.
#[async_trait]
pub trait PlatformSendAdapter: Send + Sync + fmt::Debug {
    /// Whether the destination can accept a message right now, for example
    /// because a live chat session exists.
    async fn is_ready(&self, external_destination_id: &str)
        -> std::result::Result<bool, SendError>;

    /// Transmits `text` to the destination.
    async fn send(&self, external_destination_id: &str, text: &str)
        -> std::result::Result<(), SendError>;
}

/// Send adapters keyed by platform.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformSendAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter for a platform, replacing any previous one.
    #[must_use]
    pub fn with_adapter(
        mut self,
        platform: Platform,
        adapter: Arc<dyn PlatformSendAdapter>,
    ) -> Self {
        self.register(platform, adapter);
        self
    }

    /// Registers the adapter for a platform, replacing any previous one.
    pub fn register(&mut self, platform: Platform, adapter: Arc<dyn PlatformSendAdapter>) {
        self.adapters.insert(platform, adapter);
    }

    /// Returns the adapter for a platform.
    pub fn get(&self, platform: Platform) -> Option<&Arc<dyn PlatformSendAdapter>> {
        self.adapters.get(&platform)
    }

    /// Platforms that have an adapter.
    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.adapters.keys().copied()
    }
}

/// Point-in-time view of the active destinations.
///
/// Destinations are identified by platform and internal id together: one
/// internal channel may be live on several platforms at once.
#[derive(Debug, Clone)]
pub struct DestinationSnapshot {
    destinations: HashMap<(Platform, DestinationId), DestinationInfo>,
    taken_at: DateTime<Utc>,
}

impl DestinationSnapshot {
    /// Builds a snapshot from the given destinations.
    pub fn new(
        destinations: impl IntoIterator<Item = DestinationInfo>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        let destinations = destinations
            .into_iter()
            .map(|info| ((info.platform, info.internal_id.clone()), info))
            .collect();
        Self { destinations, taken_at }
    }

    /// Looks up an active destination.
    pub fn get(&self, platform: Platform, id: &DestinationId) -> Option<&DestinationInfo> {
        self.destinations.get(&(platform, id.clone()))
    }

    /// Whether the destination is active on the given platform.
    pub fn is_active(&self, platform: Platform, id: &DestinationId) -> bool {
        self.get(platform, id).is_some()
    }

    /// Active destinations grouped by platform, each group sorted by id.
    pub fn by_platform(&self) -> BTreeMap<Platform, Vec<DestinationInfo>> {
        let mut grouped: BTreeMap<Platform, Vec<DestinationInfo>> = BTreeMap::new();
        for info in self.destinations.values() {
            grouped.entry(info.platform).or_default().push(info.clone());
        }
        for infos in grouped.values_mut() {
            infos.sort_by(|a, b| a.internal_id.cmp(&b.internal_id));
        }
        grouped
    }

    /// Number of active destinations.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Whether no destination is active.
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Source of destination snapshots.
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    /// Returns the current set of active destinations.
    async fn snapshot(&self) -> Result<DestinationSnapshot>;
}

/// Destination directory maintained in memory by an embedding process.
#[derive(Clone)]
pub struct StaticDestinationDirectory {
    destinations: Arc<RwLock<BTreeMap<(Platform, DestinationId), DestinationInfo>>>,
    clock: Arc<dyn Clock>,
}

impl StaticDestinationDirectory {
    /// Creates an empty directory.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { destinations: Arc::new(RwLock::new(BTreeMap::new())), clock }
    }

    /// Marks a destination active, replacing the record for the same
    /// platform and internal id.
    pub async fn upsert(&self, info: DestinationInfo) {
        let key = (info.platform, info.internal_id.clone());
        self.destinations.write().await.insert(key, info);
    }

    /// Removes a destination from the active set.
    pub async fn remove(&self, platform: Platform, id: &DestinationId) -> bool {
        self.destinations.write().await.remove(&(platform, id.clone())).is_some()
    }
}

#[async_trait]
impl DestinationDirectory for StaticDestinationDirectory {
    async fn snapshot(&self) -> Result<DestinationSnapshot> {
        let destinations = self.destinations.read().await.values().cloned().collect::<Vec<_>>();
        Ok(DestinationSnapshot::new(destinations, self.clock.now_utc()))
    }
}

/// Destination directory reading the `chat_destinations` table.
pub struct PostgresDestinationDirectory {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresDestinationDirectory {
    /// Creates a directory over the shared repositories.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

#[async_trait]
impl DestinationDirectory for PostgresDestinationDirectory {
    async fn snapshot(&self) -> Result<DestinationSnapshot> {
        let destinations = self
            .storage
            .destinations
            .list_active()
            .await
            .map_err(|e| DeliveryError::directory(e.to_string()))?;
        Ok(DestinationSnapshot::new(destinations, self.clock.now_utc()))
    }
}

/// Adapter that logs messages instead of transmitting them.
///
/// Reports every destination ready. Used for dry runs of the relay before
/// real platform adapters are wired in.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSendAdapter {
    platform: Platform,
}

impl LoggingSendAdapter {
    /// Creates a logging adapter for a platform.
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl PlatformSendAdapter for LoggingSendAdapter {
    async fn is_ready(
        &self,
        _external_destination_id: &str,
    ) -> std::result::Result<bool, SendError> {
        Ok(true)
    }

    async fn send(
        &self,
        external_destination_id: &str,
        text: &str,
    ) -> std::result::Result<(), SendError> {
        info!(
            platform = %self.platform,
            destination = external_destination_id,
            chars = text.chars().count(),
            "dry-run send"
        );
        Ok(())
    }
}
