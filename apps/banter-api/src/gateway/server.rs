//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time;

use crate::error::CommandError;
use crate::AppState;

use super::events::{
    AuthenticatePayload, ClientMessage, EventName, PresencePayload, ResumePayload, RoomPayload,
    SendMessagePayload, ServerMessage, OP_AUTHENTICATE, OP_JOIN_ROOM, OP_LEAVE_ROOM, OP_PING,
    OP_RESUME, OP_SEND_MESSAGE, OP_START_TYPING, OP_STOP_TYPING, OP_UPDATE_PRESENCE,
};
use super::fanout::BroadcastPayload;
use super::handler;
use super::resume::handle_resume;
use super::session::Session;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OP: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving `authenticate`/`resume` after connection (seconds).
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// The initial op parsed from the client's first message.
enum InitialOp {
    Authenticate(AuthenticatePayload),
    Resume(ResumePayload),
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for authenticate or resume within the handshake timeout.
    let initial_result = time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during handshake");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                    return Err("invalid json");
                }
            };

            match client_msg.op.as_str() {
                OP_AUTHENTICATE => {
                    let payload: AuthenticatePayload = serde_json::from_value(client_msg.d)
                        .map_err(|_| "invalid authenticate payload")?;
                    return Ok(InitialOp::Authenticate(payload));
                }
                OP_RESUME => {
                    let payload: ResumePayload = serde_json::from_value(client_msg.d)
                        .map_err(|_| "invalid resume payload")?;
                    return Ok(InitialOp::Resume(payload));
                }
                _ => {
                    let _ = send_close(
                        &mut ws_tx,
                        CLOSE_NOT_AUTHENTICATED,
                        "Expected authenticate or resume",
                    )
                    .await;
                    return Err("expected authenticate or resume");
                }
            }
        }
        Err("connection closed before handshake")
    })
    .await;

    let initial_op = match initial_result {
        Ok(Ok(op)) => op,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    match initial_op {
        InitialOp::Authenticate(payload) => {
            handle_authenticate_path(&state, payload, ws_tx, ws_rx).await;
        }
        InitialOp::Resume(payload) => {
            handle_resume_path(&state, payload, ws_tx, ws_rx).await;
        }
    }
}

/// Authenticate path: verify, restore memberships, send `ready`, run the loop.
async fn handle_authenticate_path(
    state: &AppState,
    payload: AuthenticatePayload,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    ws_rx: futures_util::stream::SplitStream<WebSocket>,
) {
    let (session, ready_msg) = match handler::handle_authenticate(state, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "authenticate failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        rooms = session.rooms().len(),
        "gateway session established"
    );

    let ready_json = serde_json::to_string(&ready_msg).unwrap();
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        return;
    }

    let session = Arc::new(session);
    let broadcast_rx = state.fanout.subscribe();
    run_session(state, session.clone(), ws_tx, ws_rx, broadcast_rx).await;

    handler::teardown_session(state, &session).await;

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "gateway session ended"
    );
}

/// Resume path: validate, replay missed events, then enter the normal loop.
async fn handle_resume_path(
    state: &AppState,
    payload: ResumePayload,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    ws_rx: futures_util::stream::SplitStream<WebSocket>,
) {
    let (session, replay_events) = match handle_resume(state, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "resume failed");
            let reconnect =
                ServerMessage::reply(EventName::RECONNECT, json!({ "reason": reason }));
            let json = serde_json::to_string(&reconnect).unwrap();
            let _ = ws_tx.send(Message::Text(json.into())).await;
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        replayed = replay_events.len(),
        "gateway session resumed"
    );

    // Subscribe to broadcasts before sending replayed events so we don't miss
    // anything that arrives concurrently.
    let broadcast_rx = state.fanout.subscribe();

    for entry in &replay_events {
        let msg = ServerMessage::event(&entry.event_name, entry.seq, entry.data.clone());
        let json = serde_json::to_string(&msg).unwrap();
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let session = Arc::new(session);
    let seq = session.next_seq();
    let resumed_msg = ServerMessage::event(EventName::RESUMED, seq, json!({}));
    let json = serde_json::to_string(&resumed_msg).unwrap();
    if ws_tx.send(Message::Text(json.into())).await.is_err() {
        return;
    }

    run_session(state, session.clone(), ws_tx, ws_rx, broadcast_rx).await;

    handler::teardown_session(state, &session).await;

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "gateway session ended (after resume)"
    );
}

/// Main session event loop: read client commands, forward broadcasts, and
/// enforce the heartbeat deadline. One slow peer only ever affects itself:
/// fan-out goes through the bounded broadcast channel, and a receiver that
/// lags just loses its oldest events.
async fn run_session(
    state: &AppState,
    session: Arc<Session>,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) {
    // Clients must show traffic within 1.5× the advertised interval.
    let heartbeat_deadline =
        Duration::from_millis(state.config.heartbeat_interval_ms * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_traffic = true;

    loop {
        tokio::select! {
            // Client sends us a command.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        got_traffic = true;
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        if !dispatch_command(state, &session, client_msg, &mut ws_tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Broadcast event from the fan-out hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !session.is_subscribed(&payload.room_id) {
                            continue;
                        }
                        if payload.origin_session.as_deref() == Some(session.session_id.as_str()) {
                            continue;
                        }

                        let seq = session.next_seq();
                        let msg = ServerMessage::event(&payload.event_name, seq, payload.data.clone());
                        let json = serde_json::to_string(&msg).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }

                        // Write to the replay buffer for resume support.
                        state.sessions.append_event(
                            &session.session_id,
                            seq,
                            &payload.event_name,
                            payload.data.clone(),
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            skipped = n,
                            "gateway session lagged behind broadcast"
                        );
                        // Continue — this session just drops its missed events.
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_traffic {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "heartbeat timeout — closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_traffic = false;
            }
        }
    }
}

/// Dispatch one client command. Returns `false` when the connection should
/// close. Command errors are answered with the op's error event and never
/// terminate the session.
async fn dispatch_command(
    state: &AppState,
    session: &Arc<Session>,
    msg: ClientMessage,
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    match msg.op.as_str() {
        OP_PING => {
            let reply = handler::handle_ping(state, session).await;
            send_message(ws_tx, &reply).await
        }
        OP_JOIN_ROOM => match serde_json::from_value::<RoomPayload>(msg.d) {
            Ok(payload) => {
                let result = handler::handle_join(state, session, payload).await;
                send_result(ws_tx, EventName::JOIN_ROOM_ERROR, result).await
            }
            Err(_) => send_malformed(ws_tx, EventName::JOIN_ROOM_ERROR).await,
        },
        OP_LEAVE_ROOM => match serde_json::from_value::<RoomPayload>(msg.d) {
            Ok(payload) => {
                let result = handler::handle_leave(state, session, payload).await;
                send_result(ws_tx, EventName::LEAVE_ROOM_ERROR, result).await
            }
            Err(_) => send_malformed(ws_tx, EventName::LEAVE_ROOM_ERROR).await,
        },
        OP_SEND_MESSAGE => match serde_json::from_value::<SendMessagePayload>(msg.d) {
            Ok(payload) => {
                let result = handler::handle_send(state, session, payload).await;
                send_result(ws_tx, EventName::SEND_MESSAGE_ERROR, result).await
            }
            Err(_) => send_malformed(ws_tx, EventName::SEND_MESSAGE_ERROR).await,
        },
        OP_START_TYPING => match serde_json::from_value::<RoomPayload>(msg.d) {
            Ok(payload) => {
                match handler::handle_start_typing(state, session, payload).await {
                    Ok(()) => true,
                    // Typing misuse is silently ignored; only the rate limit
                    // warning goes back.
                    Err(err) => match rate_limit_message(&err) {
                        Some(reply) => send_message(ws_tx, &reply).await,
                        None => true,
                    },
                }
            }
            Err(_) => true,
        },
        OP_STOP_TYPING => match serde_json::from_value::<RoomPayload>(msg.d) {
            Ok(payload) => {
                let _ = handler::handle_stop_typing(state, session, payload).await;
                true
            }
            Err(_) => true,
        },
        OP_UPDATE_PRESENCE => match serde_json::from_value::<PresencePayload>(msg.d) {
            Ok(payload) => {
                let result = handler::handle_presence_update(state, session, payload).await;
                send_result(ws_tx, EventName::UPDATE_PRESENCE_ERROR, result).await
            }
            Err(_) => send_malformed(ws_tx, EventName::UPDATE_PRESENCE_ERROR).await,
        },
        OP_AUTHENTICATE | OP_RESUME => {
            let _ = send_close(ws_tx, CLOSE_UNKNOWN_ERROR, "Already authenticated").await;
            false
        }
        _ => {
            let _ = send_close(ws_tx, CLOSE_UNKNOWN_OP, "Unknown op").await;
            false
        }
    }
}

/// Send a command's reply, converting an error into the op's error event.
async fn send_result(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    error_event: &str,
    result: Result<ServerMessage, CommandError>,
) -> bool {
    let msg = match result {
        Ok(reply) => reply,
        Err(err) => match rate_limit_message(&err) {
            Some(reply) => reply,
            None => {
                let mut data = json!({
                    "reason": err.reason(),
                    "message": err.to_string(),
                });
                if let Some(room_id) = err.room_id() {
                    data["room_id"] = json!(room_id);
                }
                ServerMessage::reply(error_event, data)
            }
        },
    };
    send_message(ws_tx, &msg).await
}

/// The unsolicited `rate_limit_exceeded` event, for any rate-limited op.
fn rate_limit_message(err: &CommandError) -> Option<ServerMessage> {
    match err {
        CommandError::RateLimited {
            action,
            retry_after_secs,
        } => Some(ServerMessage::reply(
            EventName::RATE_LIMIT_EXCEEDED,
            json!({
                "action": action,
                "retry_after_seconds": retry_after_secs,
            }),
        )),
        _ => None,
    }
}

async fn send_malformed(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    error_event: &str,
) -> bool {
    let msg = ServerMessage::reply(
        error_event,
        json!({ "reason": "validation", "message": "malformed payload" }),
    );
    send_message(ws_tx, &msg).await
}

async fn send_message(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    let json = serde_json::to_string(msg).unwrap();
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}

/// Background sweep: expire typing indicators every second and purge
/// long-disconnected sessions once a minute. One scheduled task, not one
/// timer per entry.
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = time::interval(Duration::from_secs(1));
        let mut ticks: u32 = 0;
        loop {
            tick.tick().await;

            for stopped in state.typing.sweep_expired() {
                handler::broadcast_typing_stopped(&state, &stopped, None).await;
            }

            ticks += 1;
            if ticks >= 60 {
                ticks = 0;
                let removed = state.sessions.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "purged expired gateway sessions");
                }
            }
        }
    })
}
