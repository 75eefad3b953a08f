//! Database row types, mapped 1:1 to SQLite rows. Distinct from the
//! notehub-types wire models so the storage layer stays independent.

pub struct RoomRow {
    pub id: String,
    pub encryption_salt: Option<Vec<u8>>,
    pub theme: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub client_message_id: String,
    /// Ciphertext for encrypted rooms, raw UTF-8 for plaintext rooms.
    pub body: Vec<u8>,
    /// Present iff the room is encrypted.
    pub nonce: Option<Vec<u8>>,
    pub sent_at: String,
    pub is_pinned: bool,
    pub pinned_at: Option<String>,
    pub pinned_by: Option<String>,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct DeliveryRow {
    pub message_id: String,
    pub user_id: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}
