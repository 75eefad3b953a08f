use anyhow::Result;
use rusqlite::OptionalExtension;

use crate::Database;
use crate::models::{DeliveryRow, MessageRow, ReactionRow, RoomRow};

impl Database {
    // -- Rooms --

    /// Create a room with its participant set in one transaction. The salt
    /// and the participant set are never updated afterwards — there is
    /// deliberately no query that touches either.
    pub fn create_room(
        &self,
        id: &str,
        encryption_salt: Option<&[u8]>,
        theme: &str,
        created_at: &str,
        participants: &[String],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO rooms (id, encryption_salt, theme, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, encryption_salt, theme, created_at],
            )?;
            for user_id in participants {
                tx.execute(
                    "INSERT INTO room_participants (room_id, user_id) VALUES (?1, ?2)",
                    rusqlite::params![id, user_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, encryption_salt, theme, created_at FROM rooms WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(RoomRow {
                            id: row.get(0)?,
                            encryption_salt: row.get(1)?,
                            theme: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_participants(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM room_participants WHERE room_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map([room_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn rooms_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT room_id FROM room_participants WHERE user_id = ?1")?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_theme(&self, room_id: &str, theme: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed =
                conn.execute("UPDATE rooms SET theme = ?1 WHERE id = ?2", [theme, room_id])?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Idempotency lookup for send retries.
    pub fn find_message_by_client_id(
        &self,
        room_id: &str,
        sender_id: &str,
        client_message_id: &str,
    ) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE room_id = ?1 AND sender_id = ?2 AND client_message_id = ?3"
                    ),
                    [room_id, sender_id, client_message_id],
                    map_message_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Persist a message atomically: assign the next room-scoped sequence
    /// number, insert the row, and initialize one delivery-state row per
    /// recipient (sent, not delivered). Returns the assigned sequence.
    ///
    /// Callers serialize per room, so MAX(seq)+1 cannot race with another
    /// writer on the same room.
    pub fn insert_message(
        &self,
        id: &str,
        room_id: &str,
        sender_id: &str,
        client_message_id: &str,
        body: &[u8],
        nonce: Option<&[u8]>,
        sent_at: &str,
        recipients: &[String],
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE room_id = ?1",
                [room_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, room_id, seq, sender_id, client_message_id, body, nonce, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![id, room_id, seq, sender_id, client_message_id, body, nonce, sent_at],
            )?;
            for user_id in recipients {
                tx.execute(
                    "INSERT INTO delivery_state (message_id, user_id) VALUES (?1, ?2)",
                    rusqlite::params![id, user_id],
                )?;
            }
            tx.commit()?;
            Ok(seq)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    map_message_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Catch-up/history page: messages strictly after `after_seq`, oldest
    /// first. A reconnecting client passes its last known sequence number.
    pub fn messages_after(
        &self,
        room_id: &str,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![room_id, after_seq, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Delivery state --

    /// First-write-wins delivery mark. Returns true if this call set it.
    pub fn mark_delivered(&self, message_id: &str, user_id: &str, at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE delivery_state SET delivered_at = ?1
                 WHERE message_id = ?2 AND user_id = ?3 AND delivered_at IS NULL",
                [at, message_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Mark everything in a room with seq <= `upto_seq` addressed to the
    /// user as read. Reading implies delivery, so an unset `delivered_at`
    /// is filled in with the same timestamp. Returns the number of rows
    /// newly marked — zero on replay, which is what makes the operation
    /// idempotent.
    pub fn mark_read_upto(
        &self,
        room_id: &str,
        user_id: &str,
        upto_seq: i64,
        at: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE delivery_state
                 SET read_at = ?1, delivered_at = COALESCE(delivered_at, ?1)
                 WHERE user_id = ?2 AND read_at IS NULL
                   AND message_id IN
                       (SELECT id FROM messages WHERE room_id = ?3 AND seq <= ?4)",
                rusqlite::params![at, user_id, room_id, upto_seq],
            )?;
            Ok(changed)
        })
    }

    pub fn delivery_state(&self, message_id: &str, user_id: &str) -> Result<Option<DeliveryRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT message_id, user_id, delivered_at, read_at
                     FROM delivery_state WHERE message_id = ?1 AND user_id = ?2",
                    [message_id, user_id],
                    |row| {
                        Ok(DeliveryRow {
                            message_id: row.get(0)?,
                            user_id: row.get(1)?,
                            delivered_at: row.get(2)?,
                            read_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Authoritative unread count, recomputed from delivery rows. The
    /// in-memory counter reconciles against this.
    pub fn unread_count(&self, room_id: &str, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM delivery_state ds
                 JOIN messages m ON m.id = ds.message_id
                 WHERE m.room_id = ?1 AND ds.user_id = ?2 AND ds.read_at IS NULL",
                [room_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes the row if it exists, inserts it if not.
    /// Returns true if the reaction is now present.
    pub fn toggle_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                [message_id, user_id, emoji],
            )?;
            if removed > 0 {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                [message_id, user_id, emoji, at],
            )?;
            Ok(true)
        })
    }

    pub fn reactions_for_message(&self, message_id: &str) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id, emoji, created_at
                 FROM reactions WHERE message_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([message_id], map_reaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), map_reaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Pins --

    /// Set or clear pin state. Pin conflicts resolve last-write-wins: the
    /// update overwrites all three pin fields unconditionally.
    pub fn set_pinned(
        &self,
        message_id: &str,
        pinned_by: Option<&str>,
        pinned_at: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_pinned = ?1, pinned_at = ?2, pinned_by = ?3 WHERE id = ?4",
                rusqlite::params![pinned_at.is_some(), pinned_at, pinned_by, message_id],
            )?;
            Ok(changed > 0)
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, room_id, seq, sender_id, client_message_id, body, nonce, \
                               sent_at, is_pinned, pinned_at, pinned_by";

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        seq: row.get(2)?,
        sender_id: row.get(3)?,
        client_message_id: row.get(4)?,
        body: row.get(5)?,
        nonce: row.get(6)?,
        sent_at: row.get(7)?,
        is_pinned: row.get(8)?,
        pinned_at: row.get(9)?,
        pinned_by: row.get(10)?,
    })
}

fn map_reaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRow> {
    Ok(ReactionRow {
        message_id: row.get(0)?,
        user_id: row.get(1)?,
        emoji: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn setup_room(db: &Database, users: &[&str]) -> String {
        let room_id = uuid::Uuid::new_v4().to_string();
        let participants: Vec<String> = users.iter().map(|u| u.to_string()).collect();
        db.create_room(&room_id, None, "default", &now(), &participants)
            .unwrap();
        room_id
    }

    fn send(db: &Database, room: &str, sender: &str, cmid: &str, recipients: &[&str]) -> (String, i64) {
        let id = uuid::Uuid::new_v4().to_string();
        let recipients: Vec<String> = recipients.iter().map(|u| u.to_string()).collect();
        let seq = db
            .insert_message(&id, room, sender, cmid, b"hello", None, &now(), &recipients)
            .unwrap();
        (id, seq)
    }

    #[test]
    fn sequence_is_strictly_increasing_per_room() {
        let db = Database::open_in_memory().unwrap();
        let room_a = setup_room(&db, &["alice", "bob"]);
        let room_b = setup_room(&db, &["alice", "bob"]);

        let (_, s1) = send(&db, &room_a, "alice", "c1", &["bob"]);
        let (_, s2) = send(&db, &room_a, "alice", "c2", &["bob"]);
        let (_, s3) = send(&db, &room_a, "bob", "c1", &["alice"]);
        assert_eq!((s1, s2, s3), (1, 2, 3));

        // Other rooms have their own sequence space.
        let (_, t1) = send(&db, &room_b, "alice", "c9", &["bob"]);
        assert_eq!(t1, 1);
    }

    #[test]
    fn client_message_id_lookup_finds_original() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        let (id, _) = send(&db, &room, "alice", "c1", &["bob"]);

        let found = db
            .find_message_by_client_id(&room, "alice", "c1")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);

        // Same key, different sender — no match.
        assert!(db.find_message_by_client_id(&room, "bob", "c1").unwrap().is_none());
    }

    #[test]
    fn delivery_is_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        let (id, _) = send(&db, &room, "alice", "c1", &["bob"]);

        assert!(db.mark_delivered(&id, "bob", "2026-01-01T00:00:00Z").unwrap());
        assert!(!db.mark_delivered(&id, "bob", "2026-01-02T00:00:00Z").unwrap());

        let row = db.delivery_state(&id, "bob").unwrap().unwrap();
        assert_eq!(row.delivered_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn read_implies_delivered_and_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        send(&db, &room, "alice", "c1", &["bob"]);
        send(&db, &room, "alice", "c2", &["bob"]);
        let (_, upto) = send(&db, &room, "alice", "c3", &["bob"]);

        let marked = db.mark_read_upto(&room, "bob", upto, &now()).unwrap();
        assert_eq!(marked, 3);
        assert_eq!(db.unread_count(&room, "bob").unwrap(), 0);

        // Replay is a no-op.
        let marked = db.mark_read_upto(&room, "bob", upto, &now()).unwrap();
        assert_eq!(marked, 0);

        // Read filled in delivered_at too.
        let rows = db.messages_after(&room, 0, 10).unwrap();
        for m in rows {
            let d = db.delivery_state(&m.id, "bob").unwrap().unwrap();
            assert!(d.delivered_at.is_some());
            assert!(d.read_at.is_some());
        }
    }

    #[test]
    fn unread_counts_only_unread_rows() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        let (_, s1) = send(&db, &room, "alice", "c1", &["bob"]);
        send(&db, &room, "alice", "c2", &["bob"]);
        send(&db, &room, "alice", "c3", &["bob"]);

        assert_eq!(db.unread_count(&room, "bob").unwrap(), 3);
        db.mark_read_upto(&room, "bob", s1, &now()).unwrap();
        assert_eq!(db.unread_count(&room, "bob").unwrap(), 2);
        // The sender has no delivery rows for their own messages.
        assert_eq!(db.unread_count(&room, "alice").unwrap(), 0);
    }

    #[test]
    fn reaction_toggle_inserts_then_removes() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        let (id, _) = send(&db, &room, "alice", "c1", &["bob"]);

        assert!(db.toggle_reaction(&id, "bob", "👍", &now()).unwrap());
        assert_eq!(db.reactions_for_message(&id).unwrap().len(), 1);

        assert!(!db.toggle_reaction(&id, "bob", "👍", &now()).unwrap());
        assert!(db.reactions_for_message(&id).unwrap().is_empty());
    }

    #[test]
    fn pin_overwrites_previous_pin() {
        let db = Database::open_in_memory().unwrap();
        let room = setup_room(&db, &["alice", "bob"]);
        let (id, _) = send(&db, &room, "alice", "c1", &["bob"]);

        db.set_pinned(&id, Some("alice"), Some("2026-01-01T00:00:00Z")).unwrap();
        db.set_pinned(&id, Some("bob"), Some("2026-01-02T00:00:00Z")).unwrap();

        let row = db.get_message(&id).unwrap().unwrap();
        assert!(row.is_pinned);
        assert_eq!(row.pinned_by.as_deref(), Some("bob"));

        db.set_pinned(&id, None, None).unwrap();
        let row = db.get_message(&id).unwrap().unwrap();
        assert!(!row.is_pinned);
        assert!(row.pinned_at.is_none());
    }
}
