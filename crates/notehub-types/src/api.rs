use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageView, RoomTheme};

// -- JWT Claims --

/// JWT claims shared between notehub-api (REST middleware) and
/// notehub-gateway (WebSocket authentication). Tokens are issued by the
/// external NoteHub auth service; this core only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub participant_ids: Vec<Uuid>,
    pub encrypted: bool,
    #[serde(default)]
    pub theme: Option<RoomTheme>,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub encrypted: bool,
    pub theme: RoomTheme,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetThemeRequest {
    pub theme: RoomTheme,
}

// -- Messages --

/// Catch-up/history page. `after_seq` is the pull-based reconnect cursor:
/// a client that was offline asks for everything after its last known
/// sequence number and receives those messages once, in order.
#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub room_id: Uuid,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub room_id: Uuid,
    pub unread: u64,
}
