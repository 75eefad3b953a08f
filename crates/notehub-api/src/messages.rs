use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use notehub_types::api::{Claims, MessagePage, UnreadResponse};

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Catch-up cursor: the last room sequence number the client has.
    /// Defaults to 0, i.e. full history from the beginning.
    #[serde(default)]
    pub after_seq: i64,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Pull-based catch-up and history. A reconnecting client passes the
/// highest `seq` it has seen and gets every later message once, in order.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .chat
        .pipeline
        .catch_up(room_id, claims.sub, query.after_seq, query.limit.min(200))
        .await?;

    Ok(Json(MessagePage { room_id, messages }))
}

pub async fn get_unread(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .chat
        .rooms
        .ensure_participant(room_id, claims.sub)
        .await?;
    let unread = state.chat.unread.get(room_id, claims.sub).await?;
    Ok(Json(UnreadResponse { room_id, unread }))
}
