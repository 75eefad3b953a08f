use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use notehub_types::error::ChatResult;
use notehub_types::events::ServerEvent;
use notehub_types::models::PresenceStatus;

use crate::dispatch::Dispatcher;
use crate::rooms::RoomDirectory;

/// Typing state expires this long after the last `typing.start`.
pub const TYPING_TTL: Duration = Duration::from_secs(6);

/// A user flips to offline after this long without a heartbeat. Transient
/// network blips (and quick reconnects) stay invisible.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(45);

const SHARD_COUNT: usize = 16;

struct Entry {
    status: PresenceStatus,
    last_seen: Instant,
    typing: Option<Typing>,
}

struct Typing {
    room_id: Uuid,
    expires_at: Instant,
}

/// Per-user online/offline status and per-room typing state. Ephemeral:
/// everything here is reconstructible from heartbeats and is never
/// persisted. The map is sharded by user-id hash to bound contention.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    shards: Vec<Mutex<HashMap<Uuid, Entry>>>,
    rooms: RoomDirectory,
    dispatch: Dispatcher,
}

impl PresenceTracker {
    pub fn new(rooms: RoomDirectory, dispatch: Dispatcher) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(PresenceInner {
                shards,
                rooms,
                dispatch,
            }),
        }
    }

    fn shard(&self, user_id: Uuid) -> &Mutex<HashMap<Uuid, Entry>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.inner.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.shard(user_id)
            .lock()
            .expect("presence shard poisoned")
            .get(&user_id)
            .is_some_and(|e| e.status == PresenceStatus::Online)
    }

    pub async fn set_online(&self, user_id: Uuid) {
        let changed = {
            let mut shard = self.shard(user_id).lock().expect("presence shard poisoned");
            let entry = shard.entry(user_id).or_insert(Entry {
                status: PresenceStatus::Offline,
                last_seen: Instant::now(),
                typing: None,
            });
            entry.last_seen = Instant::now();
            let changed = entry.status != PresenceStatus::Online;
            entry.status = PresenceStatus::Online;
            changed
        };
        if changed {
            self.broadcast_status(user_id, PresenceStatus::Online).await;
        }
    }

    pub async fn set_offline(&self, user_id: Uuid) {
        let (changed, was_typing) = {
            let mut shard = self.shard(user_id).lock().expect("presence shard poisoned");
            match shard.get_mut(&user_id) {
                Some(entry) => {
                    let changed = entry.status != PresenceStatus::Offline;
                    entry.status = PresenceStatus::Offline;
                    (changed, entry.typing.take().map(|t| t.room_id))
                }
                None => (false, None),
            }
        };
        if let Some(room_id) = was_typing {
            self.broadcast_typing(room_id, user_id, false).await;
        }
        if changed {
            self.broadcast_status(user_id, PresenceStatus::Offline).await;
        }
    }

    /// Refresh liveness. A heartbeat from an offline user brings them back
    /// online (with the broadcast that implies).
    pub async fn heartbeat(&self, user_id: Uuid) {
        self.set_online(user_id).await;
    }

    /// Start (or renew) typing in a room. Forbidden for non-participants.
    pub async fn start_typing(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        self.inner.rooms.ensure_participant(room_id, user_id).await?;

        let previous_room = {
            let mut shard = self.shard(user_id).lock().expect("presence shard poisoned");
            let entry = shard.entry(user_id).or_insert(Entry {
                status: PresenceStatus::Online,
                last_seen: Instant::now(),
                typing: None,
            });
            let previous = entry
                .typing
                .replace(Typing {
                    room_id,
                    expires_at: Instant::now() + TYPING_TTL,
                })
                .map(|t| t.room_id)
                .filter(|r| *r != room_id);
            previous
        };

        // Switching rooms mid-typing clears the old indicator.
        if let Some(old_room) = previous_room {
            self.broadcast_typing(old_room, user_id, false).await;
        }
        self.broadcast_typing(room_id, user_id, true).await;
        Ok(())
    }

    /// Clear typing state immediately.
    pub async fn stop_typing(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        self.inner.rooms.ensure_participant(room_id, user_id).await?;

        let was_typing = {
            let mut shard = self.shard(user_id).lock().expect("presence shard poisoned");
            shard
                .get_mut(&user_id)
                .and_then(|entry| match &entry.typing {
                    Some(t) if t.room_id == room_id => entry.typing.take(),
                    _ => None,
                })
                .is_some()
        };
        if was_typing {
            self.broadcast_typing(room_id, user_id, false).await;
        }
        Ok(())
    }

    /// Periodic decay: expire stale typing indicators and flip users with
    /// no heartbeat inside the grace window to offline. Broadcasts happen
    /// after all shard locks are released.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut expired_typing: Vec<(Uuid, Uuid)> = Vec::new();
        let mut went_offline: Vec<Uuid> = Vec::new();

        for shard in &self.inner.shards {
            let mut shard = shard.lock().expect("presence shard poisoned");
            for (user_id, entry) in shard.iter_mut() {
                if let Some(t) = &entry.typing {
                    if t.expires_at <= now {
                        expired_typing.push((t.room_id, *user_id));
                        entry.typing = None;
                    }
                }
                if entry.status == PresenceStatus::Online
                    && now.duration_since(entry.last_seen) > OFFLINE_GRACE
                {
                    entry.status = PresenceStatus::Offline;
                    went_offline.push(*user_id);
                }
            }
        }

        for (room_id, user_id) in expired_typing {
            debug!("typing state expired for {} in {}", user_id, room_id);
            self.broadcast_typing(room_id, user_id, false).await;
        }
        for user_id in went_offline {
            debug!("{} offline after heartbeat grace window", user_id);
            self.broadcast_status(user_id, PresenceStatus::Offline).await;
        }
    }

    async fn broadcast_status(&self, user_id: Uuid, status: PresenceStatus) {
        let rooms = match self.inner.rooms.rooms_for(user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::warn!("presence broadcast lookup failed for {}: {}", user_id, e);
                return;
            }
        };
        for room_id in rooms {
            self.inner
                .dispatch
                .send_to_room(
                    room_id,
                    ServerEvent::PresenceUpdate { user_id, status },
                    Some(user_id),
                )
                .await;
        }
    }

    async fn broadcast_typing(&self, room_id: Uuid, user_id: Uuid, is_typing: bool) {
        self.inner
            .dispatch
            .send_to_room(
                room_id,
                ServerEvent::TypingUpdate {
                    room_id,
                    user_id,
                    is_typing,
                },
                Some(user_id),
            )
            .await;
    }
}
