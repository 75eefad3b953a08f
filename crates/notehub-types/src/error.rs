use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the chat core. Every failure that crosses a crate
/// boundary is one of these; the gateway maps them to `error{code, message}`
/// events and the REST layer maps them to status codes.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("user {user} is not a participant of room {room}")]
    Forbidden { user: Uuid, room: Uuid },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("a room needs at least two distinct participants, got {0}")]
    InvalidParticipants(usize),

    #[error("decryption failed for room {room}")]
    Decryption { room: Uuid },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("event queue full")]
    Backpressure,

    #[error("malformed event: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable wire code for `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::InvalidParticipants(_) => "invalid_participants",
            Self::Decryption { .. } => "decryption_error",
            Self::Persistence(_) => "persistence_error",
            Self::Backpressure => "backpressure",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Persistence failures are transient: the client may retry the same
    /// operation (sends carry an idempotency key, so retries are safe).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Backpressure)
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
