//! Core domain models and strongly-typed identifiers.
//!
//! Defines outbox messages, destinations, and newtype ID wrappers for
//! compile-time type safety. Includes database serialization traits and the
//! status transition rules of the outbox delivery pipeline.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed outbox message identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned when the
/// upstream component writes the message and immutable afterwards. The id is
/// also the seed for deterministic retry backoff.
///
/// # Example
///
/// ```
/// use relay_core::models::MessageId;
/// let message_id = MessageId::new();
/// println!("Delivering message: {}", message_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw bytes of the underlying UUID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Internal destination identifier (the internal channel id).
///
/// Produced by the subscription-sync process that maps platform-native chat
/// identifiers to internal channels. Scopes channel locks and per-destination
/// rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub String);

impl DestinationId {
    /// Creates a destination id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl sqlx::Type<PgDb> for DestinationId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DestinationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for DestinationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Live-streaming platform a destination belongs to.
///
/// Selects the send adapter and namespaces channel lock keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Twitch chat.
    Twitch,
    /// YouTube live chat.
    Youtube,
    /// Kick chatroom.
    Kick,
    /// Trovo chat.
    Trovo,
    /// VK Video Live chat.
    Vkvideo,
}

impl Platform {
    /// All supported platforms.
    pub const ALL: [Self; 5] =
        [Self::Twitch, Self::Youtube, Self::Kick, Self::Trovo, Self::Vkvideo];

    /// Stable lowercase name used in storage and lock keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Youtube => "youtube",
            Self::Kick => "kick",
            Self::Trovo => "trovo",
            Self::Vkvideo => "vkvideo",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "twitch" => Ok(Self::Twitch),
            "youtube" => Ok(Self::Youtube),
            "kick" => Ok(Self::Kick),
            "trovo" => Ok(Self::Trovo),
            "vkvideo" => Ok(Self::Vkvideo),
            _ => Err(format!("invalid platform: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for Platform {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Platform {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

/// Outbox message lifecycle status.
///
/// ```text
/// pending -> processing -> sent
///    ^           |      -> failed (attempts exhausted)
///    └-----------┘ (retry, deferral, or stale reclaim)
/// ```
///
/// `Sent` and `Failed` are terminal. A `Processing` row whose claim is older
/// than the stale threshold is claimable again exactly as if it were pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for a worker to claim it.
    Pending,

    /// Claimed by a worker that is attempting delivery.
    Processing,

    /// Delivered to the platform. Terminal.
    Sent,

    /// Attempts exhausted. Terminal.
    Failed,
}

impl MessageStatus {
    /// Whether no further transition may leave this status.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid message status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for MessageStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

/// A durably stored outgoing chat message.
///
/// Written once by upstream business logic (command replies, greetings,
/// reward acknowledgements) and mutated exclusively by the delivery engine
/// from then on. Rows are never deleted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxMessage {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// Platform that owns the destination.
    pub platform: Platform,

    /// Internal routing key used for lock and rate-limit scoping.
    pub internal_destination_id: DestinationId,

    /// Platform-native chat/session identifier required by the send adapter.
    pub external_destination_id: String,

    /// Message body, normalized by the caller.
    pub payload_text: String,

    /// Current lifecycle status.
    pub status: MessageStatus,

    /// Executed send attempts. Never decreases.
    #[sqlx(try_from = "i32")]
    pub attempts: u32,

    /// Diagnostic from the most recent failed attempt.
    pub last_error: Option<String>,

    /// When the upstream component wrote the message.
    pub created_at: DateTime<Utc>,

    /// When the current claim was taken.
    pub processing_at: Option<DateTime<Utc>>,

    /// When the message was delivered (terminal).
    pub sent_at: Option<DateTime<Utc>>,

    /// When attempts were exhausted (terminal).
    pub failed_at: Option<DateTime<Utc>>,

    /// Earliest time the row may be claimed again after a failed attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Whether the message reached `sent` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a worker may claim this row given the stale cutoff.
    ///
    /// Pending rows are always claimable; processing rows only once their
    /// claim predates `stale_before`.
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            MessageStatus::Pending => true,
            MessageStatus::Processing => self.processing_at.map_or(true, |at| at < stale_before),
            MessageStatus::Sent | MessageStatus::Failed => false,
        }
    }

    /// Whether the row is held by a live (non-stale) claim.
    pub fn is_claim_live(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Processing && !self.is_claimable(stale_before)
    }

    /// Whether the retry backoff recorded on the row has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Time left until the row is due again, if its backoff is still running.
    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.next_attempt_at.filter(|at| *at > now).and_then(|at| (at - now).to_std().ok())
    }
}

/// Data required from upstream code to write a new outbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    /// Platform that owns the destination.
    pub platform: Platform,
    /// Internal routing key.
    pub internal_destination_id: DestinationId,
    /// Platform-native chat/session identifier.
    pub external_destination_id: String,
    /// Normalized message body.
    pub payload_text: String,
}

impl NewOutboxMessage {
    /// Creates a new outbox message request.
    pub fn new(
        platform: Platform,
        internal_destination_id: impl Into<DestinationId>,
        external_destination_id: impl Into<String>,
        payload_text: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            internal_destination_id: internal_destination_id.into(),
            external_destination_id: external_destination_id.into(),
            payload_text: payload_text.into(),
        }
    }

    /// Materializes the pending row with a fresh id.
    pub fn into_message(self, created_at: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id: MessageId::new(),
            platform: self.platform,
            internal_destination_id: self.internal_destination_id,
            external_destination_id: self.external_destination_id,
            payload_text: self.payload_text,
            status: MessageStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at,
            processing_at: None,
            sent_at: None,
            failed_at: None,
            next_attempt_at: None,
        }
    }
}

impl From<String> for DestinationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one holder of a channel lock.
///
/// Each broker job run mints a fresh token so a run that outlived its lock
/// TTL cannot release a lock that was since granted to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(pub Uuid);

impl OwnerToken {
    /// Creates a new random owner token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel lock key, namespaced as `{platform}:{internal_destination_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(String);

impl LockKey {
    /// Builds the lock key for a destination.
    pub fn for_destination(platform: Platform, destination: &DestinationId) -> Self {
        Self(format!("{platform}:{destination}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A destination as seen by the subscription-sync collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DestinationInfo {
    /// Internal channel id.
    pub internal_id: DestinationId,
    /// Platform the channel lives on.
    pub platform: Platform,
    /// Platform-native chat/session id.
    pub external_id: String,
}

/// Record of a permanently failed message kept for operator review.
///
/// Dead letters are never reprocessed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    /// Message that exhausted its attempts.
    pub message_id: MessageId,
    /// Platform of the destination.
    pub platform: Platform,
    /// Internal destination the message was addressed to.
    pub internal_destination_id: DestinationId,
    /// Attempts recorded at failure.
    #[sqlx(try_from = "i32")]
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: Option<String>,
    /// When the message was marked failed.
    pub failed_at: DateTime<Utc>,
}
