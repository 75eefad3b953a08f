use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use notehub_types::api::{Claims, CreateRoomRequest, RoomResponse, SetThemeRequest};
use notehub_types::models::ChatRoom;

use crate::{ApiError, AppState};

/// Create a room. The caller is always part of the participant set, so a
/// client only has to list the people it is inviting.
pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut participants = req.participant_ids.clone();
    if !participants.contains(&claims.sub) {
        participants.push(claims.sub);
    }

    let room = state
        .chat
        .rooms
        .create_room(&participants, req.encrypted, req.theme)
        .await?;

    info!("{} created room {}", claims.sub, room.id);
    Ok((StatusCode::CREATED, Json(room_response(&room))))
}

pub async fn set_theme(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetThemeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = state
        .chat
        .rooms
        .set_theme(room_id, req.theme, claims.sub)
        .await?;
    Ok(Json(room_response(&room)))
}

fn room_response(room: &ChatRoom) -> RoomResponse {
    RoomResponse {
        id: room.id,
        participant_ids: room.participants.clone(),
        encrypted: room.is_encrypted(),
        theme: room.theme,
        created_at: room.created_at,
    }
}
