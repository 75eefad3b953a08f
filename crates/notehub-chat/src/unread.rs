use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use notehub_db::Database;
use notehub_types::error::{ChatError, ChatResult};

/// Derived per-user-per-room unread counts. This is a cache over the
/// delivery-state rows, not a source of truth: `reconcile` recomputes a
/// counter from the database whenever drift is suspected, and cold reads
/// load through it.
#[derive(Clone)]
pub struct UnreadCounters {
    inner: Arc<Inner>,
}

struct Inner {
    counts: Mutex<HashMap<(Uuid, Uuid), u64>>,
    db: Arc<Database>,
}

impl UnreadCounters {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(Inner {
                counts: Mutex::new(HashMap::new()),
                db,
            }),
        }
    }

    pub fn increment(&self, room_id: Uuid, user_id: Uuid) {
        let mut counts = self.inner.counts.lock().expect("unread lock poisoned");
        *counts.entry((room_id, user_id)).or_insert(0) += 1;
    }

    pub fn reset(&self, room_id: Uuid, user_id: Uuid) {
        let mut counts = self.inner.counts.lock().expect("unread lock poisoned");
        counts.insert((room_id, user_id), 0);
    }

    /// Current count; loads through from the database on a cold miss.
    pub async fn get(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<u64> {
        {
            let counts = self.inner.counts.lock().expect("unread lock poisoned");
            if let Some(count) = counts.get(&(room_id, user_id)) {
                return Ok(*count);
            }
        }
        self.reconcile(room_id, user_id).await
    }

    /// Recompute from delivery rows where `read_at IS NULL` and overwrite
    /// the cached value. The recompute query runs off the async runtime.
    pub async fn reconcile(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<u64> {
        let db = self.inner.db.clone();
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let count = tokio::task::spawn_blocking(move || db.unread_count(&room, &user))
            .await
            .map_err(|e| ChatError::Internal(e.to_string()))?
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        let mut counts = self.inner.counts.lock().expect("unread lock poisoned");
        counts.insert((room_id, user_id), count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn increment_and_reset_never_go_negative() {
        let unread = UnreadCounters::new(db());
        let (room, user) = (Uuid::new_v4(), Uuid::new_v4());

        unread.increment(room, user);
        unread.increment(room, user);
        assert_eq!(unread.get(room, user).await.unwrap(), 2);

        unread.reset(room, user);
        assert_eq!(unread.get(room, user).await.unwrap(), 0);

        // Reset again — still zero, not negative.
        unread.reset(room, user);
        assert_eq!(unread.get(room, user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_overwrites_drifted_counter() {
        let database = db();
        let unread = UnreadCounters::new(database.clone());
        let (room, user) = (Uuid::new_v4(), Uuid::new_v4());

        // Drift the cache with no matching delivery rows.
        unread.increment(room, user);
        unread.increment(room, user);
        assert_eq!(unread.get(room, user).await.unwrap(), 2);

        assert_eq!(unread.reconcile(room, user).await.unwrap(), 0);
        assert_eq!(unread.get(room, user).await.unwrap(), 0);
    }
}
