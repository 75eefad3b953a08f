use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use notehub_crypto::{CryptoError, EncryptionManager};
use notehub_db::Database;
use notehub_db::models::{MessageRow, ReactionRow};
use notehub_types::error::{ChatError, ChatResult};
use notehub_types::events::ServerEvent;
use notehub_types::models::{ChatRoom, MessageView, ReactionGroup};

use crate::dispatch::Dispatcher;
use crate::rooms::RoomDirectory;
use crate::unread::UnreadCounters;
use crate::{parse_ts, parse_uuid};

/// The ordered, per-room write path. Every state-changing operation on a
/// room — send, ack, read, react, pin — runs under that room's sequencer
/// lock, so all of them form one total order per room. Different rooms
/// share nothing and proceed fully concurrently.
pub struct MessagePipeline {
    db: Arc<Database>,
    rooms: RoomDirectory,
    crypto: Arc<EncryptionManager>,
    dispatch: Dispatcher,
    unread: UnreadCounters,
    sequencers: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MessagePipeline {
    pub fn new(
        db: Arc<Database>,
        rooms: RoomDirectory,
        crypto: Arc<EncryptionManager>,
        dispatch: Dispatcher,
        unread: UnreadCounters,
    ) -> Self {
        Self {
            db,
            rooms,
            crypto,
            dispatch,
            unread,
            sequencers: RwLock::new(HashMap::new()),
        }
    }

    async fn sequencer(&self, room_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.sequencers.read().await.get(&room_id) {
            return lock.clone();
        }
        self.sequencers
            .write()
            .await
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// SQLite work goes off the async runtime; a held connection mutex
    /// must never stall a tokio worker.
    async fn run_db<T, F>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ChatError::Internal(e.to_string()))?
            .map_err(|e| ChatError::Persistence(e.to_string()))
    }

    /// Send a message: authorize, encrypt (if the room has a salt),
    /// persist with the next room sequence number, initialize delivery
    /// rows, bump unread counters, and fan out `message.new`.
    ///
    /// `client_message_id` makes this idempotent: a retry with the same
    /// (sender, client_message_id) returns the originally persisted
    /// message, so a client that saw a `persistence_error` can resend
    /// without risking a duplicate.
    pub async fn send_message(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        client_message_id: &str,
        body: &str,
    ) -> ChatResult<MessageView> {
        let room = self.rooms.room(room_id).await?;
        if !room.has_participant(sender_id) {
            return Err(ChatError::Forbidden {
                user: sender_id,
                room: room_id,
            });
        }

        let lock = self.sequencer(room_id).await;
        let _guard = lock.lock().await;

        // Idempotent replay: the original row wins.
        let existing = {
            let (room_key, sender_key, cmid) = (
                room_id.to_string(),
                sender_id.to_string(),
                client_message_id.to_string(),
            );
            self.run_db(move |db| db.find_message_by_client_id(&room_key, &sender_key, &cmid))
                .await?
        };
        if let Some(existing) = existing {
            debug!(
                "send replay for client_message_id {} in room {}",
                client_message_id, room_id
            );
            return self.view_with_reactions(&room, existing).await;
        }

        let (stored_body, nonce) = match &room.encryption_salt {
            Some(salt) => {
                let (ciphertext, nonce) = self
                    .crypto
                    .encrypt(room_id, salt, body.as_bytes())
                    .await
                    .map_err(|e| ChatError::Internal(e.to_string()))?;
                (ciphertext, Some(nonce))
            }
            None => (body.as_bytes().to_vec(), None),
        };

        let message_id = Uuid::new_v4();
        let sent_at = Utc::now();
        let recipients: Vec<String> = room
            .participants
            .iter()
            .filter(|p| **p != sender_id)
            .map(|p| p.to_string())
            .collect();

        let seq = {
            let (id, room_key, sender_key, cmid, sent) = (
                message_id.to_string(),
                room_id.to_string(),
                sender_id.to_string(),
                client_message_id.to_string(),
                sent_at.to_rfc3339(),
            );
            self.run_db(move |db| {
                db.insert_message(
                    &id,
                    &room_key,
                    &sender_key,
                    &cmid,
                    &stored_body,
                    nonce.as_deref(),
                    &sent,
                    &recipients,
                )
            })
            .await?
        };

        for recipient in &room.participants {
            if *recipient != sender_id {
                self.unread.increment(room_id, *recipient);
            }
        }

        let view = MessageView {
            id: message_id,
            room_id,
            seq,
            sender_id,
            body: body.to_string(),
            sent_at,
            is_pinned: false,
            pinned_at: None,
            pinned_by: None,
            reactions: vec![],
        };

        self.dispatch
            .send_to_room(
                room_id,
                ServerEvent::MessageNew {
                    message: view.clone(),
                },
                None,
            )
            .await;

        info!("message {} (seq {}) sent in room {}", message_id, seq, room_id);
        Ok(view)
    }

    /// First-write-wins delivery receipt. Notifies the sender's sockets
    /// only on the transition, so replays are silent.
    pub async fn ack_delivery(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        let row = self.message_row(message_id).await?;
        let room_id = parse_uuid(&row.room_id);
        self.rooms.ensure_participant(room_id, user_id).await?;

        let lock = self.sequencer(room_id).await;
        let _guard = lock.lock().await;

        let newly_delivered = {
            let (id, user) = (message_id.to_string(), user_id.to_string());
            self.run_db(move |db| db.mark_delivered(&id, &user, &Utc::now().to_rfc3339()))
                .await?
        };

        if newly_delivered {
            self.dispatch
                .send_to_user(
                    parse_uuid(&row.sender_id),
                    ServerEvent::MessageDelivered {
                        message_id,
                        user_id,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Mark everything up to `upto_message_id` as read for this user.
    /// Reading implies delivery. Idempotent: a replay (equal or older
    /// cutoff) changes no rows and emits no event. One summary event is
    /// broadcast rather than one per message, and the user's unread
    /// counter for the room resets to zero.
    pub async fn mark_read(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        upto_message_id: Uuid,
    ) -> ChatResult<()> {
        self.rooms.ensure_participant(room_id, user_id).await?;

        let upto = self.message_row(upto_message_id).await?;
        if parse_uuid(&upto.room_id) != room_id {
            return Err(ChatError::NotFound {
                kind: "message",
                id: upto_message_id,
            });
        }

        let lock = self.sequencer(room_id).await;
        let _guard = lock.lock().await;

        let marked = {
            let (room_key, user) = (room_id.to_string(), user_id.to_string());
            let upto_seq = upto.seq;
            self.run_db(move |db| {
                db.mark_read_upto(&room_key, &user, upto_seq, &Utc::now().to_rfc3339())
            })
            .await?
        };

        self.unread.reset(room_id, user_id);

        if marked > 0 {
            self.dispatch
                .send_to_room(
                    room_id,
                    ServerEvent::MessageRead {
                        room_id,
                        user_id,
                        upto_message_id,
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Toggle a reaction and broadcast the resulting set for the message.
    pub async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<Vec<ReactionGroup>> {
        let row = self.message_row(message_id).await?;
        let room_id = parse_uuid(&row.room_id);
        self.rooms.ensure_participant(room_id, user_id).await?;

        let lock = self.sequencer(room_id).await;
        let _guard = lock.lock().await;

        let rows = {
            let (id, user, emoji) = (
                message_id.to_string(),
                user_id.to_string(),
                emoji.to_string(),
            );
            self.run_db(move |db| {
                db.toggle_reaction(&id, &user, &emoji, &Utc::now().to_rfc3339())?;
                db.reactions_for_message(&id)
            })
            .await?
        };
        let reactions = group_reactions(&rows);

        self.dispatch
            .send_to_room(
                room_id,
                ServerEvent::ReactionUpdated {
                    message_id,
                    reactions: reactions.clone(),
                },
                None,
            )
            .await;
        Ok(reactions)
    }

    /// Pin a message. Concurrent pins resolve last-write-wins: the pin
    /// fields are overwritten unconditionally inside the room's total
    /// order, so the final state is whichever pin came last.
    pub async fn pin(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        let room_id = self.set_pin_state(message_id, user_id, true).await?;
        self.dispatch
            .send_to_room(
                room_id,
                ServerEvent::MessagePinned {
                    message_id,
                    pinned_by: user_id,
                },
                None,
            )
            .await;
        Ok(())
    }

    pub async fn unpin(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        let room_id = self.set_pin_state(message_id, user_id, false).await?;
        self.dispatch
            .send_to_room(room_id, ServerEvent::MessageUnpinned { message_id }, None)
            .await;
        Ok(())
    }

    async fn set_pin_state(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        pinned: bool,
    ) -> ChatResult<Uuid> {
        let row = self.message_row(message_id).await?;
        let room_id = parse_uuid(&row.room_id);
        self.rooms.ensure_participant(room_id, user_id).await?;

        let lock = self.sequencer(room_id).await;
        let _guard = lock.lock().await;

        let (by, at) = if pinned {
            (Some(user_id.to_string()), Some(Utc::now().to_rfc3339()))
        } else {
            (None, None)
        };
        let id = message_id.to_string();
        self.run_db(move |db| db.set_pinned(&id, by.as_deref(), at.as_deref()))
            .await?;
        Ok(room_id)
    }

    /// Pull-based catch-up: everything in the room strictly after
    /// `after_seq`, oldest first. A reconnecting client passes its last
    /// known sequence and receives each missed message exactly once.
    /// Messages that fail decryption are withheld and logged, never
    /// surfaced as corrupt plaintext.
    pub async fn catch_up(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        after_seq: i64,
        limit: u32,
    ) -> ChatResult<Vec<MessageView>> {
        self.rooms.ensure_participant(room_id, user_id).await?;
        let room = self.rooms.room(room_id).await?;

        let (rows, reaction_rows) = {
            let room_key = room_id.to_string();
            self.run_db(move |db| {
                let rows = db.messages_after(&room_key, after_seq, limit)?;
                let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
                let reactions = db.reactions_for_messages(&ids)?;
                Ok((rows, reactions))
            })
            .await?
        };

        let mut by_message: HashMap<String, Vec<ReactionRow>> = HashMap::new();
        for r in reaction_rows {
            by_message.entry(r.message_id.clone()).or_default().push(r);
        }

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let body = match self.open_body(&room, &row).await {
                Ok(body) => body,
                Err(e) => {
                    error!(
                        "withholding message {} in room {}: {}",
                        row.id, room_id, e
                    );
                    continue;
                }
            };
            let reactions = by_message
                .get(&row.id)
                .map(|rs| group_reactions(rs))
                .unwrap_or_default();
            views.push(view_from_row(&row, body, reactions));
        }
        Ok(views)
    }

    async fn view_with_reactions(
        &self,
        room: &ChatRoom,
        row: MessageRow,
    ) -> ChatResult<MessageView> {
        let body = self.open_body(room, &row).await?;
        let rows = {
            let id = row.id.clone();
            self.run_db(move |db| db.reactions_for_message(&id)).await?
        };
        Ok(view_from_row(&row, body, group_reactions(&rows)))
    }

    /// Recover the plaintext body of a stored row. For encrypted rooms
    /// this consults the Encryption Manager; a failure here is always
    /// alert-worthy.
    async fn open_body(&self, room: &ChatRoom, row: &MessageRow) -> ChatResult<String> {
        match (&row.nonce, &room.encryption_salt) {
            (Some(nonce), Some(salt)) => {
                let plaintext = self
                    .crypto
                    .decrypt(room.id, salt, &row.body, nonce)
                    .await
                    .map_err(|e| match e {
                        CryptoError::Decrypt => ChatError::Decryption { room: room.id },
                        CryptoError::Encrypt => ChatError::Internal(e.to_string()),
                    })?;
                String::from_utf8(plaintext)
                    .map_err(|_| ChatError::Decryption { room: room.id })
            }
            (None, None) => String::from_utf8(row.body.clone())
                .map_err(|_| ChatError::Internal("non-utf8 plaintext body".into())),
            // A nonce without a salt (or vice versa) means the row and the
            // room disagree about encryption — treat as a decryption
            // failure and withhold.
            _ => Err(ChatError::Decryption { room: room.id }),
        }
    }

    async fn message_row(&self, message_id: Uuid) -> ChatResult<MessageRow> {
        let id = message_id.to_string();
        self.run_db(move |db| db.get_message(&id))
            .await?
            .ok_or(ChatError::NotFound {
                kind: "message",
                id: message_id,
            })
    }
}

fn view_from_row(row: &MessageRow, body: String, reactions: Vec<ReactionGroup>) -> MessageView {
    MessageView {
        id: parse_uuid(&row.id),
        room_id: parse_uuid(&row.room_id),
        seq: row.seq,
        sender_id: parse_uuid(&row.sender_id),
        body,
        sent_at: parse_ts(&row.sent_at),
        is_pinned: row.is_pinned,
        pinned_at: row.pinned_at.as_deref().map(parse_ts),
        pinned_by: row.pinned_by.as_deref().map(parse_uuid),
        reactions,
    }
}

/// Group raw reaction rows by emoji, sorted for stable output.
fn group_reactions(rows: &[ReactionRow]) -> Vec<ReactionGroup> {
    let mut by_emoji: HashMap<&str, Vec<Uuid>> = HashMap::new();
    for row in rows {
        by_emoji
            .entry(row.emoji.as_str())
            .or_default()
            .push(parse_uuid(&row.user_id));
    }
    let mut groups: Vec<ReactionGroup> = by_emoji
        .into_iter()
        .map(|(emoji, user_ids)| ReactionGroup {
            emoji: emoji.to_string(),
            count: user_ids.len(),
            user_ids,
        })
        .collect();
    groups.sort_by(|a, b| a.emoji.cmp(&b.emoji));
    groups
}
