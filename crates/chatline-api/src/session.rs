//! One WebSocket per (room, user): admission, greeting, the read and write
//! loops, and cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chatline_delivery::Ingest;
use chatline_gateway::Connection;
use chatline_types::commands::ClientCommand;
use chatline_types::events::ServerEvent;
use chatline_types::models::MessageBody;

use crate::state::AppState;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A single socket write longer than this counts as a dead client.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state, room_id, user_id))
}

async fn send_event(sender: &mut WsSink, event: &ServerEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("session: could not encode frame: {}", e);
            return true;
        }
    };
    matches!(
        tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(text.into()))).await,
        Ok(Ok(()))
    )
}

async fn close(sender: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from(reason),
    };
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Close(Some(frame)))).await;
}

pub async fn handle_session(socket: WebSocket, state: AppState, room_id: Uuid, user_id: Uuid) {
    let (mut sender, receiver) = socket.split();

    let room = match state.gate.validate_and_track(room_id, user_id).await {
        Ok(room) => room,
        Err(e) => {
            info!("session: user {} refused from room {}: {}", user_id, room_id, e);
            send_event(&mut sender, &ServerEvent::error(e.code(), e.to_string())).await;
            close(&mut sender, close_code::POLICY, e.code()).await;
            return;
        }
    };

    state.bridge.ensure_subscribed(room_id).await;
    let (conn, outbound) = state.hub.register(room_id, user_id).await;
    info!("session: user {} joined room {} ({})", user_id, room_id, room.name);

    if greet(&state, &mut sender, room_id).await {
        run_loops(&state, conn, sender, receiver, outbound).await;
    }

    // order matters: the bridge only lets go once the gate shows the room empty
    state.hub.unregister(&conn).await;
    state.gate.remove_connection(room_id, user_id);
    state.bridge.release_if_empty(room_id);
    info!("session: user {} left room {}", user_id, room_id);
}

/// Room status, then the recent history oldest first. False if the client
/// went away meanwhile.
async fn greet(state: &AppState, sender: &mut WsSink, room_id: Uuid) -> bool {
    match state.gate.room_status(room_id).await {
        Ok(status) => {
            if !send_event(sender, &ServerEvent::RoomStatus(status)).await {
                return false;
            }
        }
        Err(e) => warn!(room_id = %room_id, "session: room status unavailable: {}", e),
    }

    let history = state.pipeline.history();
    let recent = match history.recent(room_id, state.history_limit).await {
        Ok(recent) => recent,
        Err(e) => {
            warn!(room_id = %room_id, "session: history unavailable: {}", e);
            return true;
        }
    };
    for view in history.enrich(&recent).await {
        if !send_event(sender, &ServerEvent::History(view)).await {
            return false;
        }
    }
    true
}

async fn run_loops(
    state: &AppState,
    conn: Connection,
    mut sender: WsSink,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: tokio::sync::mpsc::Receiver<Utf8Bytes>,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        // the hub dropped us: slow consumer or room closed
                        close(&mut sender, close_code::AWAY, "disconnected").await;
                        break;
                    };
                    let sent = tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(frame))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if !handle_text(&recv_state, &conn, text.as_str()).await {
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
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
}

/// Handles one client text frame. Returns false when the client asked to
/// leave.
async fn handle_text(state: &AppState, conn: &Connection, text: &str) -> bool {
    let cmd = match text.parse::<ClientCommand>() {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(
                "session: user {} bad command: {} -- raw: {}",
                conn.user_id,
                e,
                text.chars().take(200).collect::<String>()
            );
            state
                .hub
                .send_to(conn, &ServerEvent::error(e.code(), e.to_string()))
                .await;
            return true;
        }
    };
    trace!(user_id = %conn.user_id, room_id = %conn.room_id, ?cmd, "session: command");

    let (room_id, user_id) = (conn.room_id, conn.user_id);
    let ingest = match cmd {
        ClientCommand::Leave => {
            info!("session: user {} left room {} on request", user_id, room_id);
            return false;
        }
        ClientCommand::Say { text } => Ingest::Message {
            room_id,
            user_id,
            body: MessageBody::Text { text },
        },
        ClientCommand::Reply { reply_to, text } => Ingest::Message {
            room_id,
            user_id,
            body: MessageBody::Reply { reply_to, text },
        },
        ClientCommand::Sticker { sticker_id } => Ingest::Message {
            room_id,
            user_id,
            body: MessageBody::Sticker { sticker_id },
        },
        ClientCommand::React { message_id, emoji } => Ingest::Reaction {
            room_id,
            user_id,
            message_id,
            emoji,
        },
        ClientCommand::Unreact { message_id } => Ingest::Unreact {
            room_id,
            user_id,
            message_id,
        },
        ClientCommand::Read { message_id } => Ingest::Receipt {
            room_id,
            user_id,
            message_id,
        },
        ClientCommand::Unsend { message_id } => Ingest::Unsend {
            room_id,
            user_id,
            message_id,
        },
    };

    if let Err(e) = state.pipeline.ingest(ingest).await {
        debug!(user_id = %user_id, room_id = %room_id, "session: rejected: {}", e);
        state
            .hub
            .send_to(conn, &ServerEvent::error(e.code(), e.to_string()))
            .await;
    }
    true
}
