pub mod messages;
pub mod middleware;
pub mod rooms;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use notehub_chat::Chat;
use notehub_types::error::ChatError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: Arc<Chat>,
    pub jwt_secret: String,
}

/// REST-side rendering of the core error taxonomy.
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ChatError::NotFound { .. } => StatusCode::NOT_FOUND,
            ChatError::InvalidParticipants(_) | ChatError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatError::Persistence(_) | ChatError::Backpressure => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChatError::Decryption { .. } | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
