use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::trace;
use uuid::Uuid;

use notehub_types::events::ServerEvent;

/// Bound on each session's outbound queue. Message-bearing events block
/// the producer when the queue is full; ephemeral events are dropped.
const SESSION_QUEUE_CAP: usize = 256;

struct SessionHandle {
    user_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

/// Process-scoped registry of live sessions and their room subscriptions.
/// Fan-out is always room-scoped and membership-gated upstream; the
/// dispatcher itself only routes.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// session_id -> handle
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    /// user_id -> sessions (a user may have several devices connected)
    by_user: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// room_id -> subscribed sessions
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: RwLock::new(HashMap::new()),
                by_user: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a session for a user. Returns the session id and the
    /// receiving end of its bounded event queue.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAP);

        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, SessionHandle { user_id, tx });
        self.inner
            .by_user
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(session_id);

        (session_id, rx)
    }

    /// Deregister a session, discarding whatever was still queued for it.
    /// Returns the user id if this was the user's last session.
    pub async fn unregister(&self, session_id: Uuid) -> Option<Uuid> {
        let handle = self.inner.sessions.write().await.remove(&session_id)?;

        for subscribers in self.inner.rooms.write().await.values_mut() {
            subscribers.remove(&session_id);
        }

        let mut by_user = self.inner.by_user.write().await;
        if let Some(sessions) = by_user.get_mut(&handle.user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                by_user.remove(&handle.user_id);
                return Some(handle.user_id);
            }
        }
        None
    }

    pub async fn subscribe(&self, session_id: Uuid, room_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(session_id);
    }

    /// Send to one session. Used for direct replies (errors) on the
    /// session that issued a command.
    pub async fn send_to_session(&self, session_id: Uuid, event: ServerEvent) {
        let tx = {
            let sessions = self.inner.sessions.read().await;
            sessions.get(&session_id).map(|h| h.tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Send to every session of one user, applying backpressure.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        for tx in self.user_txs(user_id).await {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Fan an event out to every session subscribed to the room. Message-
    /// bearing events are awaited sends: a slow consumer slows the
    /// producer, nothing is silently dropped. Ephemeral events (typing,
    /// presence) use try_send instead — a session with a full queue simply
    /// misses them, they are reconstructible signals.
    pub async fn send_to_room(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        except_user: Option<Uuid>,
    ) {
        let ephemeral = event.is_ephemeral();
        for tx in self.room_txs(room_id, except_user).await {
            if ephemeral {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                    trace!("dropping ephemeral event for saturated session in room {}", room_id);
                }
            } else {
                let _ = tx.send(event.clone()).await;
            }
        }
    }

    /// Drop all sessions. Closing the senders ends every connection's
    /// forward loop, which is how shutdown drains active sessions.
    pub async fn drain(&self) {
        self.inner.sessions.write().await.clear();
        self.inner.by_user.write().await.clear();
        self.inner.rooms.write().await.clear();
    }

    async fn user_txs(&self, user_id: Uuid) -> Vec<mpsc::Sender<ServerEvent>> {
        let session_ids = {
            let by_user = self.inner.by_user.read().await;
            by_user.get(&user_id).cloned().unwrap_or_default()
        };
        let sessions = self.inner.sessions.read().await;
        session_ids
            .iter()
            .filter_map(|id| sessions.get(id).map(|h| h.tx.clone()))
            .collect()
    }

    // Sender clones are collected under the read lock and sent after it is
    // released, so a blocked send never holds up registration.
    async fn room_txs(
        &self,
        room_id: Uuid,
        except_user: Option<Uuid>,
    ) -> Vec<mpsc::Sender<ServerEvent>> {
        let subscriber_ids = {
            let rooms = self.inner.rooms.read().await;
            rooms.get(&room_id).cloned().unwrap_or_default()
        };
        let sessions = self.inner.sessions.read().await;
        subscriber_ids
            .iter()
            .filter_map(|id| sessions.get(id))
            .filter(|h| Some(h.user_id) != except_user)
            .map(|h| h.tx.clone())
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
