pub mod dispatch;
pub mod pipeline;
pub mod presence;
pub mod rooms;
pub mod unread;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use notehub_crypto::EncryptionManager;
use notehub_db::Database;
use notehub_types::error::ChatResult;

use dispatch::Dispatcher;
use pipeline::MessagePipeline;
use presence::PresenceTracker;
use rooms::RoomDirectory;
use unread::UnreadCounters;

/// Cached room keys are dropped after this much idleness.
pub const KEY_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// The chat core: wires the room directory, presence tracker, message
/// pipeline, unread counters and session dispatcher around one database
/// handle and one encryption manager.
pub struct Chat {
    pub rooms: RoomDirectory,
    pub presence: PresenceTracker,
    pub pipeline: MessagePipeline,
    pub unread: UnreadCounters,
    pub dispatch: Dispatcher,
    pub crypto: Arc<EncryptionManager>,
    pub db: Arc<Database>,
}

impl Chat {
    /// `room_secret` is the pre-established shared secret combined with
    /// each room's salt to derive per-room keys.
    pub fn new(db: Arc<Database>, room_secret: impl Into<Vec<u8>>) -> Arc<Self> {
        let crypto = Arc::new(EncryptionManager::new(room_secret));
        let dispatch = Dispatcher::new();
        let rooms = RoomDirectory::new(db.clone());
        let presence = PresenceTracker::new(rooms.clone(), dispatch.clone());
        let unread = UnreadCounters::new(db.clone());
        let pipeline = MessagePipeline::new(
            db.clone(),
            rooms.clone(),
            crypto.clone(),
            dispatch.clone(),
            unread.clone(),
        );

        Arc::new(Self {
            rooms,
            presence,
            pipeline,
            unread,
            dispatch,
            crypto,
            db,
        })
    }

    /// Register a session for a room's fan-out. The participant check here
    /// is the only gate — a non-participant learns nothing about the room,
    /// not even whether it exists is distinguishable from forbidden access
    /// at the event layer.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        room_id: Uuid,
    ) -> ChatResult<()> {
        self.rooms.ensure_participant(room_id, user_id).await?;
        self.dispatch.subscribe(session_id, room_id).await;
        debug!("session {} subscribed to room {}", session_id, room_id);
        Ok(())
    }

    /// Background maintenance: presence/typing decay and key-cache
    /// eviction. Runs until the shutdown signal flips.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let chat = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        chat.presence.sweep().await;
                        let evicted = chat.crypto.evict_idle(KEY_IDLE_TIMEOUT).await;
                        if evicted > 0 {
                            debug!("evicted {} idle room keys", evicted);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("maintenance task stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Teardown: drop every session queue so connection loops drain out.
    pub async fn drain(&self) {
        self.dispatch.drain().await;
    }
}

/// Timestamps are stored as RFC 3339 text; rows written by this core
/// always parse, so a failure means external tampering and falls back to
/// the epoch rather than panicking.
pub(crate) fn parse_ts(raw: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .unwrap_or_else(|e| {
            tracing::warn!("corrupt timestamp '{}': {}", raw, e);
            chrono::DateTime::default()
        })
}

pub(crate) fn parse_uuid(raw: &str) -> Uuid {
    raw.parse::<Uuid>().unwrap_or_else(|e| {
        tracing::warn!("corrupt uuid '{}': {}", raw, e);
        Uuid::default()
    })
}
