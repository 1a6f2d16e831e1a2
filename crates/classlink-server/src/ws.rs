//! WebSocket transport.
//!
//! One tokio task per connection.  The handshake authenticates the bearer
//! credential before the upgrade completes; a failed handshake is an HTTP
//! 401 and never joins a room.  After upgrade the connection joins its
//! user room, gets pending messages replayed, and enters a sequential
//! event loop: every client frame is handled to completion, errors are
//! answered on the socket (ack error or `rejoinFailed`) and never tear
//! the connection down.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use classlink_shared::error::Result;
use classlink_shared::protocol::{AckPayload, ClientEvent, ClientFrame, ServerEvent};

use crate::api::AppState;
use crate::auth::{bearer_from_headers, Identity};
use crate::error::ApiError;
use crate::topic::{ConnId, EventSender};

/// Handshake: authenticate, then upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let token = bearer_from_headers(&headers)
        .or_else(|| params.get("token").cloned())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let identity = state.authenticator.authenticate(&token).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, identity, state)))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let conn_id: ConnId = Uuid::new_v4();
    let user = identity.user_id;

    info!(user = %user, conn = %conn_id, "connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Forward room events from the outbound channel onto the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound event");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Initial registration: join rooms, flip presence, drain the offline
    // queue.  On failure the client is told to issue `rejoinRooms`.
    join_rooms(&identity, conn_id, &tx, &state).await;

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&text, &identity, conn_id, &tx, &state).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(user = %user, conn = %conn_id, "client closed connection");
                        break;
                    }
                    // Ping/pong is handled by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(user = %user, conn = %conn_id, error = %e, "socket error");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => break,
        }
    }

    // Cleanup: leave every room; only the user's last connection flips the
    // durable flag and triggers the offline broadcast.
    if let Some((user, last)) = state.registry.unregister(&conn_id).await {
        if last {
            if let Err(e) = state.presence.mark_offline(user).await {
                warn!(user = %user, error = %e, "offline transition failed");
            }
        }
    }

    send_task.abort();
    info!(user = %user, conn = %conn_id, "connection closed");
}

/// Register the connection and run the post-registration side effects.
/// Registration failures are reported as `rejoinFailed` so the client can
/// explicitly retry; they never kill the socket.
async fn join_rooms(identity: &Identity, conn_id: ConnId, tx: &EventSender, state: &AppState) {
    let user = identity.user_id;
    match state.registry.register(user, conn_id, tx.clone()).await {
        Ok(()) => {
            if let Err(e) = state.presence.mark_online(user).await {
                warn!(user = %user, error = %e, "online transition failed");
            }
            state.pipeline.replay_pending(user).await;
        }
        Err(e) => {
            warn!(user = %user, conn = %conn_id, error = %e, "room join failed");
            let _ = tx.send(ServerEvent::RejoinFailed { reason: e.to_string() });
        }
    }
}

/// Parse and dispatch one client frame, answering with an ack when the
/// frame carried a `seq`.
async fn handle_frame(
    raw: &str,
    identity: &Identity,
    conn_id: ConnId,
    tx: &EventSender,
    state: &AppState,
) {
    let frame = match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(user = %identity.user_id, error = %e, "malformed frame");
            // Salvage the seq if there is one so the client's callback
            // still fires.
            let seq = serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|v| v.get("seq").and_then(Value::as_u64));
            if let Some(seq) = seq {
                let _ = tx.send(ServerEvent::Ack(AckPayload::error(
                    seq,
                    format!("Invalid frame: {e}"),
                )));
            }
            return;
        }
    };

    let seq = frame.seq;
    let result = handle_event(frame.event, identity, conn_id, tx, state).await;

    match (seq, result) {
        (Some(seq), Ok(body)) => {
            let _ = tx.send(ServerEvent::Ack(AckPayload::success(seq, body)));
        }
        (Some(seq), Err(e)) => {
            debug!(user = %identity.user_id, kind = e.kind(), error = %e, "event failed");
            let _ = tx.send(ServerEvent::Ack(AckPayload::error(seq, e.to_string())));
        }
        (None, Ok(_)) => {}
        (None, Err(e)) => {
            warn!(user = %identity.user_id, kind = e.kind(), error = %e, "unacked event failed");
        }
    }
}

/// Route one event to its component.  Each arm is all-or-nothing: an error
/// leaves no partial state and only surfaces through the ack.
async fn handle_event(
    event: ClientEvent,
    identity: &Identity,
    conn_id: ConnId,
    tx: &EventSender,
    state: &AppState,
) -> Result<Value> {
    let user = identity.user_id;

    match event {
        ClientEvent::RejoinRooms => {
            state.registry.register(user, conn_id, tx.clone()).await?;
            state.presence.mark_online(user).await?;
            state.pipeline.replay_pending(user).await;
            Ok(json!({ "rejoined": true }))
        }

        ClientEvent::GetUsers => {
            let users = state.roster.roster_for(user).await?;
            Ok(json!({ "users": users }))
        }

        ClientEvent::ToggleFavorite { target_id } => {
            let favorite = state.roster.toggle_favorite(user, target_id).await?;
            Ok(json!({ "favorite": favorite }))
        }

        ClientEvent::SendMessage(payload) => {
            let message_id = state.pipeline.send(user, payload).await?;
            Ok(json!({ "messageId": message_id }))
        }

        ClientEvent::GetMessages { counterpart_id } => {
            let messages = state.pipeline.fetch(user, counterpart_id).await?;
            Ok(json!({ "messages": messages }))
        }

        ClientEvent::ClearChats { counterpart_id } => {
            let deleted = state.pipeline.clear(user, counterpart_id).await?;
            Ok(json!({ "deleted": deleted }))
        }

        ClientEvent::GetUserProfile { user_id } => {
            let profile = state.pipeline.profile(user_id).await?;
            Ok(json!({ "user": profile }))
        }

        ClientEvent::GetCallLogs { counterpart_id } => {
            let calls = state.calls.logs(user, counterpart_id).await?;
            Ok(json!({ "calls": calls }))
        }

        ClientEvent::CallUser { to, offer, caller_name } => {
            let caller_name = caller_name.or_else(|| Some(identity.display_name.clone()));
            let (call_id, status) = state.calls.initiate(user, to, offer, caller_name).await?;
            Ok(json!({ "callId": call_id, "callStatus": status }))
        }

        ClientEvent::AnswerCall { answer, call_id, .. } => {
            state.calls.answer(user, call_id, answer).await?;
            Ok(json!({ "callId": call_id }))
        }

        ClientEvent::IceCandidate { to, candidate, call_id } => {
            state.calls.relay_ice(user, to, candidate, call_id).await?;
            Ok(json!({ "relayed": true }))
        }

        ClientEvent::RejectCall { call_id, .. } => {
            state.calls.reject(user, call_id).await?;
            Ok(json!({ "callId": call_id }))
        }

        ClientEvent::EndCall { call_id, .. } => {
            let duration_secs = state.calls.end(user, call_id).await?;
            Ok(json!({ "callId": call_id, "durationSecs": duration_secs }))
        }
    }
}
