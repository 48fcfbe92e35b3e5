//! Test data builders for outbox messages and destinations.

use chrono::{DateTime, Utc};
use relay_core::models::{
    DestinationId, DestinationInfo, MessageStatus, NewOutboxMessage, OutboxMessage, Platform,
};

/// Builder for outbox messages with sensible defaults.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    platform: Platform,
    destination: DestinationId,
    external_destination_id: Option<String>,
    text: String,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    /// Creates a Twitch message to `chan-1`.
    pub fn new() -> Self {
        Self {
            platform: Platform::Twitch,
            destination: DestinationId::new("chan-1"),
            external_destination_id: None,
            text: "hello chat".to_string(),
        }
    }

    /// Sets the platform.
    #[must_use]
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the internal destination.
    #[must_use]
    pub fn destination(mut self, destination: impl Into<DestinationId>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Sets the platform-native destination id. Defaults to
    /// [`external_id_for`] of the internal destination.
    #[must_use]
    pub fn external(mut self, external_destination_id: impl Into<String>) -> Self {
        self.external_destination_id = Some(external_destination_id.into());
        self
    }

    /// Sets the message body.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builds the upstream insert request.
    pub fn build(self) -> NewOutboxMessage {
        let external = self
            .external_destination_id
            .unwrap_or_else(|| external_id_for(&self.destination));
        NewOutboxMessage::new(self.platform, self.destination, external, self.text)
    }

    /// Builds a row left in `processing` by a worker that claimed it at
    /// `claimed_at` and never finished.
    pub fn abandoned_claim(
        self,
        created_at: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
        attempts: u32,
    ) -> OutboxMessage {
        let mut message = self.build().into_message(created_at);
        message.status = MessageStatus::Processing;
        message.processing_at = Some(claimed_at);
        message.attempts = attempts;
        message
    }
}

/// External id the fixtures pair with an internal destination.
pub fn external_id_for(destination: &DestinationId) -> String {
    format!("ext-{destination}")
}

/// Active destination record for the fixtures' naming scheme.
pub fn destination(platform: Platform, id: &str) -> DestinationInfo {
    let internal_id = DestinationId::new(id);
    DestinationInfo { external_id: external_id_for(&internal_id), internal_id, platform }
}
