use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room color theme. Closed set — unknown values are rejected at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomTheme {
    Default,
    Dark,
    Sepia,
    Contrast,
}

impl RoomTheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Dark => "dark",
            Self::Sepia => "sepia",
            Self::Contrast => "contrast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "dark" => Some(Self::Dark),
            "sepia" => Some(Self::Sepia),
            "contrast" => Some(Self::Contrast),
            _ => None,
        }
    }
}

/// A chat room. The participant set and the encryption salt are immutable
/// after creation; only the theme may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    /// `None` means the room stores plaintext. Fixed at creation — there is
    /// no path that flips a room between encrypted and unencrypted.
    #[serde(skip_serializing)]
    pub encryption_salt: Option<Vec<u8>>,
    pub theme: RoomTheme,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn is_encrypted(&self) -> bool {
        self.encryption_salt.is_some()
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }
}

/// A message as delivered to clients. Payload encryption is a storage
/// concern; by the time a message reaches the wire it is plaintext again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub room_id: Uuid,
    /// Room-scoped, strictly increasing. Clients use this as the catch-up
    /// cursor after a reconnect.
    pub seq: i64,
    pub sender_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub pinned_by: Option<Uuid>,
    pub reactions: Vec<ReactionGroup>,
}

/// Reactions to one message, grouped by emoji.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

/// Online/offline status carried on `presence.update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}
