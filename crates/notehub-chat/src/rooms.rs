use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use notehub_db::Database;
use notehub_types::error::{ChatError, ChatResult};
use notehub_types::models::{ChatRoom, RoomTheme};

use crate::{parse_ts, parse_uuid};

/// Authoritative room → participants/salt/theme mapping, backed by the
/// database with a read-through cache. `is_participant` here is the sole
/// authorization check for every room-scoped operation in the core.
#[derive(Clone)]
pub struct RoomDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    db: Arc<Database>,
    cache: RwLock<HashMap<Uuid, Arc<ChatRoom>>>,
}

impl RoomDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                db,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Lookups and writes go through `spawn_blocking`; the connection
    /// mutex plus SQLite I/O must not park a tokio worker.
    async fn run_db<T, F>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ChatError::Internal(e.to_string()))?
            .map_err(|e| ChatError::Persistence(e.to_string()))
    }

    /// Create a room. A fresh random salt is generated iff `encrypted`;
    /// the encrypted/unencrypted status is fixed from here on.
    pub async fn create_room(
        &self,
        participants: &[Uuid],
        encrypted: bool,
        theme: Option<RoomTheme>,
    ) -> ChatResult<ChatRoom> {
        let distinct: BTreeSet<Uuid> = participants.iter().copied().collect();
        if distinct.len() < 2 {
            return Err(ChatError::InvalidParticipants(distinct.len()));
        }

        let room = ChatRoom {
            id: Uuid::new_v4(),
            participants: distinct.into_iter().collect(),
            encryption_salt: encrypted.then(|| notehub_crypto::keys::generate_salt().to_vec()),
            theme: theme.unwrap_or(RoomTheme::Default),
            created_at: Utc::now(),
        };

        let participant_ids: Vec<String> =
            room.participants.iter().map(|u| u.to_string()).collect();
        {
            let (id, salt, theme, created) = (
                room.id.to_string(),
                room.encryption_salt.clone(),
                room.theme.as_str(),
                room.created_at.to_rfc3339(),
            );
            self.run_db(move |db| {
                db.create_room(&id, salt.as_deref(), theme, &created, &participant_ids)
            })
            .await?;
        }

        info!(
            "room {} created ({} participants, encrypted={})",
            room.id,
            room.participants.len(),
            room.is_encrypted()
        );

        self.inner
            .cache
            .write()
            .await
            .insert(room.id, Arc::new(room.clone()));
        Ok(room)
    }

    pub async fn room(&self, room_id: Uuid) -> ChatResult<Arc<ChatRoom>> {
        if let Some(room) = self.inner.cache.read().await.get(&room_id) {
            return Ok(room.clone());
        }

        let (row, participants) = {
            let id = room_id.to_string();
            self.run_db(move |db| {
                let row = db.get_room(&id)?;
                let participants = match &row {
                    Some(row) => db.get_participants(&row.id)?,
                    None => vec![],
                };
                Ok((row, participants))
            })
            .await?
        };
        let row = row.ok_or(ChatError::NotFound {
            kind: "room",
            id: room_id,
        })?;

        let room = Arc::new(ChatRoom {
            id: room_id,
            participants: participants.iter().map(|s| parse_uuid(s)).collect(),
            encryption_salt: row.encryption_salt,
            theme: RoomTheme::parse(&row.theme).unwrap_or(RoomTheme::Default),
            created_at: parse_ts(&row.created_at),
        });

        self.inner
            .cache
            .write()
            .await
            .insert(room_id, room.clone());
        Ok(room)
    }

    pub async fn is_participant(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        Ok(self.room(room_id).await?.has_participant(user_id))
    }

    /// The standard gate: `Forbidden` for non-participants, with no
    /// distinction that would leak room state.
    pub async fn ensure_participant(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        if self.is_participant(room_id, user_id).await? {
            Ok(())
        } else {
            Err(ChatError::Forbidden {
                user: user_id,
                room: room_id,
            })
        }
    }

    /// All rooms the user participates in (used for presence broadcasts).
    pub async fn rooms_for(&self, user_id: Uuid) -> ChatResult<Vec<Uuid>> {
        let user = user_id.to_string();
        let ids = self.run_db(move |db| db.rooms_for_user(&user)).await?;
        Ok(ids.iter().map(|s| parse_uuid(s)).collect())
    }

    pub async fn set_theme(
        &self,
        room_id: Uuid,
        theme: RoomTheme,
        actor: Uuid,
    ) -> ChatResult<ChatRoom> {
        self.ensure_participant(room_id, actor).await?;

        {
            let id = room_id.to_string();
            self.run_db(move |db| db.set_theme(&id, theme.as_str()))
                .await?;
        }

        let mut cache = self.inner.cache.write().await;
        let room = self.room_from_cache_or_err(&cache, room_id)?;
        let mut updated = (*room).clone();
        updated.theme = theme;
        cache.insert(room_id, Arc::new(updated.clone()));
        Ok(updated)
    }

    fn room_from_cache_or_err(
        &self,
        cache: &HashMap<Uuid, Arc<ChatRoom>>,
        room_id: Uuid,
    ) -> ChatResult<Arc<ChatRoom>> {
        cache.get(&room_id).cloned().ok_or(ChatError::NotFound {
            kind: "room",
            id: room_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn rejects_fewer_than_two_distinct_participants() {
        let dir = RoomDirectory::new(db());
        let alice = Uuid::new_v4();

        let err = dir.create_room(&[alice], false, None).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(1)));

        // Duplicates collapse before the check.
        let err = dir
            .create_room(&[alice, alice], false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(1)));
    }

    #[tokio::test]
    async fn encrypted_room_gets_a_salt_plain_room_does_not() {
        let dir = RoomDirectory::new(db());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let plain = dir.create_room(&[a, b], false, None).await.unwrap();
        assert!(!plain.is_encrypted());

        let encrypted = dir.create_room(&[a, b], true, None).await.unwrap();
        assert!(encrypted.is_encrypted());
        assert_eq!(encrypted.encryption_salt.as_ref().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn membership_gate() {
        let dir = RoomDirectory::new(db());
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = dir.create_room(&[a, b], false, None).await.unwrap();

        assert!(dir.is_participant(room.id, a).await.unwrap());
        assert!(!dir.is_participant(room.id, outsider).await.unwrap());
        assert!(matches!(
            dir.ensure_participant(room.id, outsider).await,
            Err(ChatError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let dir = RoomDirectory::new(db());
        assert!(matches!(
            dir.room(Uuid::new_v4()).await,
            Err(ChatError::NotFound { kind: "room", .. })
        ));
    }

    #[tokio::test]
    async fn set_theme_requires_participant() {
        let dir = RoomDirectory::new(db());
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = dir.create_room(&[a, b], false, None).await.unwrap();

        let updated = dir.set_theme(room.id, RoomTheme::Dark, a).await.unwrap();
        assert_eq!(updated.theme, RoomTheme::Dark);

        assert!(matches!(
            dir.set_theme(room.id, RoomTheme::Sepia, outsider).await,
            Err(ChatError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn cache_miss_reloads_from_db() {
        let shared = db();
        let dir = RoomDirectory::new(shared.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = dir.create_room(&[a, b], true, None).await.unwrap();

        // A fresh directory over the same database must see the room.
        let cold = RoomDirectory::new(shared);
        let loaded = cold.room(room.id).await.unwrap();
        assert_eq!(loaded.participants.len(), 2);
        assert_eq!(loaded.encryption_salt, room.encryption_salt);
    }
}
