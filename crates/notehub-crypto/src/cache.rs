use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct Slot {
    key: Option<[u8; 32]>,
    last_used: Instant,
}

/// Bounded-lifetime cache of derived room keys. Each room gets its own
/// slot lock, so a slow first derivation for one room never blocks
/// lookups for another.
pub struct KeyCache {
    rooms: RwLock<HashMap<Uuid, Arc<Mutex<Slot>>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the cached key for a room, running `derive` under the room's
    /// slot lock if no key is cached. Concurrent callers for the same room
    /// serialize on the slot; only one derives.
    pub async fn get_or_derive<F>(&self, room_id: Uuid, derive: F) -> [u8; 32]
    where
        F: FnOnce() -> [u8; 32],
    {
        let slot = {
            let rooms = self.rooms.read().await;
            rooms.get(&room_id).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(room_id)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Slot {
                            key: None,
                            last_used: Instant::now(),
                        }))
                    })
                    .clone()
            }
        };

        let mut guard = slot.lock().await;
        guard.last_used = Instant::now();
        match guard.key {
            Some(key) => key,
            None => {
                let key = derive();
                guard.key = Some(key);
                key
            }
        }
    }

    /// Evict rooms idle longer than `max_idle`. Slots currently locked by
    /// an in-flight operation are kept. Returns the eviction count.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard.last_used.elapsed() <= max_idle,
            Err(_) => true,
        });
        before - rooms.len()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}
