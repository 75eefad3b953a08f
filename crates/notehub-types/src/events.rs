use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageView, PresenceStatus, ReactionGroup};

/// Events sent FROM client TO server over the WebSocket gateway.
/// Unknown shapes fail deserialization and are answered with an `error`
/// event instead of being coerced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Authenticate the connection. Must be the first event.
    #[serde(rename = "auth")]
    Auth { token: String },

    /// Register this connection for a room's fan-out events.
    #[serde(rename = "subscribe")]
    Subscribe { room_id: Uuid },

    /// Send a message. `client_message_id` is the idempotency key: a retry
    /// with the same value returns the originally persisted message.
    #[serde(rename = "message.send")]
    MessageSend {
        room_id: Uuid,
        client_message_id: String,
        body: String,
    },

    /// Confirm a message reached this client.
    #[serde(rename = "message.ack")]
    MessageAck { message_id: Uuid },

    /// Mark everything up to and including the given message as read.
    #[serde(rename = "read.mark")]
    ReadMark {
        room_id: Uuid,
        upto_message_id: Uuid,
    },

    /// Toggle a reaction on a message (add if absent, remove if present).
    #[serde(rename = "reaction.toggle")]
    ReactionToggle { message_id: Uuid, emoji: String },

    #[serde(rename = "message.pin")]
    MessagePin { message_id: Uuid },

    #[serde(rename = "message.unpin")]
    MessageUnpin { message_id: Uuid },

    /// Typing indicator. Repeated starts renew the expiry; no separate
    /// renew event exists.
    #[serde(rename = "typing.start")]
    TypingStart { room_id: Uuid },

    #[serde(rename = "typing.stop")]
    TypingStop { room_id: Uuid },
}

/// Events sent FROM server TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message.new")]
    MessageNew { message: MessageView },

    #[serde(rename = "message.delivered")]
    MessageDelivered { message_id: Uuid, user_id: Uuid },

    /// One summary event per `read.mark`, not one per message.
    #[serde(rename = "message.read")]
    MessageRead {
        room_id: Uuid,
        user_id: Uuid,
        upto_message_id: Uuid,
    },

    /// Carries the full resulting reaction set for the message, so clients
    /// never have to reconcile incremental add/remove deltas.
    #[serde(rename = "reaction.updated")]
    ReactionUpdated {
        message_id: Uuid,
        reactions: Vec<ReactionGroup>,
    },

    #[serde(rename = "message.pinned")]
    MessagePinned { message_id: Uuid, pinned_by: Uuid },

    #[serde(rename = "message.unpinned")]
    MessageUnpinned { message_id: Uuid },

    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
    },

    #[serde(rename = "typing.update")]
    TypingUpdate {
        room_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    /// Ephemeral events may be dropped when a session's queue is full.
    /// Message-bearing events must never be: they apply backpressure
    /// instead.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            Self::PresenceUpdate { .. } | Self::TypingUpdate { .. }
        )
    }
}
