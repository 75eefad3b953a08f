use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use notehub_chat::Chat;
use notehub_types::events::{ClientEvent, ServerEvent};

use crate::AuthVerifier;

/// Server sends a Ping at this interval; two consecutive missed Pongs
/// drop the connection. Pongs double as presence heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The `auth` event must arrive this quickly after the upgrade.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single socket write. A peer that stops reading stalls
/// its send task here; past this the connection is dropped, which closes
/// the session queue and unblocks any room fan-out waiting on it.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: authenticate, register the
/// session, then run the split send/receive loops until either side ends.
pub async fn handle_connection(socket: WebSocket, chat: Arc<Chat>, auth: AuthVerifier) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match wait_for_auth(&mut receiver, &auth).await {
        Some(user_id) => user_id,
        None => {
            warn!("WebSocket client failed to authenticate, closing");
            let refusal = ServerEvent::Error {
                code: "auth_error".into(),
                message: "authentication required".into(),
            };
            if let Ok(text) = serde_json::to_string(&refusal) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            return;
        }
    };

    info!("{} connected to gateway", user_id);

    let (session_id, mut session_rx) = chat.dispatch.register(user_id).await;

    // A fresh connection counts as a heartbeat and flips the user online.
    chat.presence.heartbeat(user_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events to the client, interleaved with heartbeats.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        // Queue closed: session was drained or unregistered.
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            warn!("socket write stalled for {:?}, dropping connection", WRITE_TIMEOUT);
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Ping(vec![].into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    // Read events from the client.
    let chat_recv = chat.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        handle_event(&chat_recv, session_id, user_id, event).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} sent a malformed event: {} -- raw: {}",
                            user_id,
                            e,
                            truncate_for_log(&text, 200)
                        );
                        chat_recv
                            .dispatch
                            .send_to_session(
                                session_id,
                                ServerEvent::Error {
                                    code: "bad_request".into(),
                                    message: format!("unrecognized event: {}", e),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    chat_recv.presence.heartbeat(user_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Deregister and discard anything still queued. Offline is NOT
    // broadcast here: the presence sweeper flips the user only after the
    // heartbeat grace window, which absorbs quick reconnects.
    if let Some(last_user) = chat.dispatch.unregister(session_id).await {
        info!("{} disconnected from gateway (last session)", last_user);
    } else {
        info!("{} disconnected from gateway", user_id);
    }
}

async fn wait_for_auth(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    auth: &AuthVerifier,
) -> Option<Uuid> {
    let handshake = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientEvent::Auth { token }) =
                    serde_json::from_str::<ClientEvent>(&text)
                {
                    return auth.verify(&token).ok().map(|claims| claims.sub);
                }
                // Anything before auth is a protocol violation.
                return None;
            }
        }
        None
    });

    handshake.await.ok().flatten()
}

/// Clip raw client text for logging. Client input is arbitrary UTF-8, so
/// the cut must land on a char boundary or the slice panics.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Dispatch one validated client event into the core. Failures come back
/// to the issuing session as `error{code, message}` events; authorization
/// failures change no state.
async fn handle_event(chat: &Arc<Chat>, session_id: Uuid, user_id: Uuid, event: ClientEvent) {
    let result = match event {
        // Already authenticated at the handshake.
        ClientEvent::Auth { .. } => Ok(()),

        ClientEvent::Subscribe { room_id } => {
            chat.subscribe(session_id, user_id, room_id).await
        }

        ClientEvent::MessageSend {
            room_id,
            client_message_id,
            body,
        } => chat
            .pipeline
            .send_message(room_id, user_id, &client_message_id, &body)
            .await
            .map(|_| ()),

        ClientEvent::MessageAck { message_id } => {
            chat.pipeline.ack_delivery(message_id, user_id).await
        }

        ClientEvent::ReadMark {
            room_id,
            upto_message_id,
        } => chat.pipeline.mark_read(user_id, room_id, upto_message_id).await,

        ClientEvent::ReactionToggle { message_id, emoji } => chat
            .pipeline
            .toggle_reaction(message_id, user_id, &emoji)
            .await
            .map(|_| ()),

        ClientEvent::MessagePin { message_id } => chat.pipeline.pin(message_id, user_id).await,

        ClientEvent::MessageUnpin { message_id } => {
            chat.pipeline.unpin(message_id, user_id).await
        }

        ClientEvent::TypingStart { room_id } => {
            chat.presence.start_typing(room_id, user_id).await
        }

        ClientEvent::TypingStop { room_id } => {
            chat.presence.stop_typing(room_id, user_id).await
        }
    };

    if let Err(e) = result {
        warn!("{} event failed: {}", user_id, e);
        chat.dispatch
            .send_to_session(
                session_id,
                ServerEvent::Error {
                    code: e.code().into(),
                    message: e.to_string(),
                },
            )
            .await;
    }
}
