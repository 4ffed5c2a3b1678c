//! The per-socket connection handler.
//!
//! Accept sequence: shutdown gate, origin allow-list, query-string
//! credentials, token verification, room-id validation, then room
//! acquisition. Close codes: 1008 for anything the client got wrong, 1011
//! for a failed room initialization, 1012 while shutting down.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{SecondsFormat, Utc};
use coderoom_core::protocol::{
    self, BinaryFrame, ClientMessage, ServerMessage, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
    CLOSE_SERVICE_RESTART, PING, PONG,
};
use coderoom_core::{validate_room_id, UserIdentity};
use coderoom_realtime::{outbound_channel, OutboundFrame, OutboundSender};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::ApiState;


enum Accept {
    Proceed { room_id: String, user: UserIdentity },
    Reject { code: u16, reason: &'static str },
}

pub(crate) async fn websocket_upgrade(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let verdict = accept_verdict(&state, &headers, &params);
    ws.on_upgrade(move |socket| serve_socket(socket, state, verdict))
}

fn accept_verdict(
    state: &ApiState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Accept {
    if state.shutdown.is_shutting_down() {
        return Accept::Reject {
            code: CLOSE_SERVICE_RESTART,
            reason: "server shutting down",
        };
    }
    if !origin_allowed(&state.allowed_origins, headers) {
        return Accept::Reject {
            code: CLOSE_POLICY_VIOLATION,
            reason: "origin not allowed",
        };
    }

    let (Some(token), Some(room_id)) = (params.get("token"), params.get("room")) else {
        return Accept::Reject {
            code: CLOSE_POLICY_VIOLATION,
            reason: "room and token query parameters are required",
        };
    };
    let Ok(user) = state.keys.verify(token) else {
        return Accept::Reject {
            code: CLOSE_POLICY_VIOLATION,
            reason: "invalid token",
        };
    };
    if validate_room_id(room_id).is_err() {
        return Accept::Reject {
            code: CLOSE_POLICY_VIOLATION,
            reason: "invalid room id",
        };
    }

    Accept::Proceed {
        room_id: room_id.clone(),
        user,
    }
}

/// Empty allow-list accepts any origin (development mode). Trailing slashes
/// are ignored on both sides.
fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = headers.get(ORIGIN).and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let origin = origin.trim_end_matches('/');
    allowed
        .iter()
        .any(|candidate| candidate.trim_end_matches('/') == origin)
}

async fn serve_socket(socket: WebSocket, state: ApiState, verdict: Accept) {
    let (room_id, user) = match verdict {
        Accept::Proceed { room_id, user } => (room_id, user),
        Accept::Reject { code, reason } => {
            close_socket(socket, code, reason).await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = outbound_channel();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Binary(payload) => {
                    if sink.send(Message::Binary(payload.to_vec())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let conn_id = Uuid::new_v4().to_string();
    let room = match state.registry.attach(&room_id, &conn_id, outbound.clone()).await {
        Ok(room) => room,
        Err(error) => {
            tracing::error!(room = %room_id, %error, "room initialization failed");
            let _ = outbound
                .send(OutboundFrame::Close {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "room initialization failed",
                })
                .await;
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };
    tracing::debug!(room = %room_id, user = %user.username, "socket joined");

    send_text(
        &outbound,
        ServerMessage::Welcome {
            message: "connected".to_owned(),
            room_id: room_id.clone(),
            user: user.clone(),
        }
        .to_json(),
    )
    .await;
    let full_state = room.encode_doc_state().await;
    send_binary(&outbound, protocol::sync_frame(&full_state)).await;
    if let Some(frame) = room.presence_snapshot_frame() {
        send_binary(&outbound, frame).await;
    }

    let mut claimed_clients: HashSet<u64> = HashSet::new();

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Binary(payload) => match protocol::parse_binary_frame(&payload) {
                Some(BinaryFrame::Sync(update)) => {
                    if !room.effective_role(&user).can_edit() {
                        send_text(
                            &outbound,
                            ServerMessage::Error {
                                message: "insufficient permissions for editing".to_owned(),
                            }
                            .to_json(),
                        )
                        .await;
                        continue;
                    }
                    if let Err(error) = room.apply_sync(update, &conn_id).await {
                        tracing::debug!(room = %room_id, %error, "dropped malformed sync update");
                    }
                }
                Some(BinaryFrame::Awareness(payload)) => {
                    match room.apply_presence(payload, &conn_id) {
                        Ok(client_ids) => claimed_clients.extend(client_ids),
                        Err(error) => {
                            tracing::debug!(room = %room_id, %error, "dropped malformed presence update");
                        }
                    }
                }
                None => {}
            },
            Message::Text(text) => {
                if text == PING {
                    send_text(&outbound, PONG.to_owned()).await;
                    continue;
                }
                if let Some(ClientMessage::Chat { text }) = protocol::parse_client_message(&text) {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let chat = ServerMessage::Chat {
                        id: Uuid::new_v4().to_string(),
                        user_id: user.user_id.clone(),
                        username: user.username.clone(),
                        text: trimmed.to_owned(),
                        sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    };
                    room.broadcast_text_all(&chat.to_json());
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let claimed: Vec<u64> = claimed_clients.into_iter().collect();
    state.registry.release(&room, &conn_id, &claimed).await;
    tracing::debug!(room = %room_id, user = %user.username, "socket left");
    drop(outbound);
    let _ = writer.await;
}

async fn send_text(outbound: &OutboundSender, text: String) {
    let _ = outbound.send(OutboundFrame::Text(text.into())).await;
}

async fn send_binary(outbound: &OutboundSender, frame: Vec<u8>) {
    let _ = outbound.send(OutboundFrame::Binary(frame.into())).await;
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
