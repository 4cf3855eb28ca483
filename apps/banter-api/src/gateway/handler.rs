//! Command handlers: authenticate, room join/leave, message publish, typing,
//! presence updates, and disconnect teardown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::error::CommandError;
use crate::store::messages::{Message, MessageStore};
use crate::AppState;

use super::events::{
    AuthenticatePayload, EventName, PresencePayload, RoomPayload, SendMessagePayload,
    ServerMessage,
};
use super::fanout::BroadcastPayload;
use super::presence;
use super::ratelimit::Action;
use super::room_members_key;
use super::session::Session;

/// Maximum message content length in bytes for `text` messages.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Recent messages returned with `room_joined`.
const HISTORY_PAGE: i64 = 50;

/// How many times the membership restore is attempted on connect.
const RESTORE_ATTEMPTS: u32 = 3;

/// Background persistence retry schedule.
const PERSIST_RETRY_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Process an `authenticate` op. Returns the new session and the `ready`
/// event on success. No session state exists until the token verifies.
pub async fn handle_authenticate(
    state: &AppState,
    payload: AuthenticatePayload,
) -> Result<(Session, ServerMessage), &'static str> {
    let user = state
        .auth
        .verify(&payload.token)
        .await
        .ok_or("Invalid or expired token")?;

    // Restore durable room memberships, tolerating a flaky collaborator: a
    // degraded connect with an empty room set beats a refused connection.
    let mut restored: Option<Vec<String>> = None;
    for attempt in 1..=RESTORE_ATTEMPTS {
        match state.rooms.list_user_rooms(&user.user_id).await {
            Ok(rooms) => {
                restored = Some(rooms);
                break;
            }
            Err(e) => {
                tracing::warn!(user_id = %user.user_id, attempt, %e, "membership restore failed");
            }
        }
    }
    let degraded = restored.is_none();
    let room_list = restored.unwrap_or_default();

    let session_id = banter_common::id::prefixed_ulid(banter_common::id::prefix::SESSION);

    for room_id in &room_list {
        if let Err(e) = state
            .kv
            .sadd(&room_members_key(room_id), &user.user_id)
            .await
        {
            tracing::warn!(%session_id, %room_id, %e, "failed to restore subscriber entry");
        }
    }

    let room_set: HashSet<String> = room_list.iter().cloned().collect();
    state.sessions.register(
        session_id.clone(),
        user.user_id.clone(),
        user.display_name.clone(),
        room_set.clone(),
    );

    if let Err(e) = state.presence.set_online(&user.user_id, &session_id).await {
        tracing::warn!(%session_id, %e, "failed to write presence record");
    }

    let ready_data = json!({
        "session_id": session_id,
        "user": {
            "id": user.user_id,
            "display_name": user.display_name,
        },
        "rooms": room_list,
        "degraded": degraded,
        "heartbeat_interval": state.config.heartbeat_interval_ms,
    });

    let session = Session::new(session_id, user.user_id, user.display_name, room_set);
    let seq = session.next_seq();
    let ready = ServerMessage::event(EventName::READY, seq, ready_data);

    Ok((session, ready))
}

/// Process `join_room`. Idempotent: rejoining an already-joined room replies
/// `room_joined` again without duplicating membership.
pub async fn handle_join(
    state: &AppState,
    session: &Session,
    payload: RoomPayload,
) -> Result<ServerMessage, CommandError> {
    check_limit(state, session, Action::JoinRoom)?;
    let room_id = payload.room_id;

    if !state.rooms.room_exists(&room_id).await? {
        return Err(CommandError::RoomNotFound { room_id });
    }
    if !state.rooms.is_member(&session.user_id, &room_id).await? {
        return Err(CommandError::NotAMember { room_id });
    }

    if session.add_room(&room_id) {
        if let Err(e) = state
            .kv
            .sadd(&room_members_key(&room_id), &session.user_id)
            .await
        {
            // Undo the local subscription so a retry starts clean.
            session.remove_room(&room_id);
            return Err(e.into());
        }
        state
            .sessions
            .set_rooms(&session.session_id, session.rooms());

        state
            .fanout
            .dispatch(BroadcastPayload {
                room_id: room_id.clone(),
                event_name: EventName::USER_JOINED.to_string(),
                data: json!({
                    "room_id": room_id,
                    "user_id": session.user_id,
                    "display_name": session.display_name,
                }),
                origin_session: Some(session.session_id.clone()),
            })
            .await;
    }

    touch_presence(state, session, Some(&room_id)).await;

    let recent = state.messages.history(&room_id, None, HISTORY_PAGE).await?;
    let member_ids = state.kv.smembers(&room_members_key(&room_id)).await?;
    let roster = state.presence.statuses(&member_ids).await?;
    let members: Vec<_> = roster
        .into_iter()
        .map(|(user_id, status)| json!({ "user_id": user_id, "status": status }))
        .collect();

    Ok(ServerMessage::reply(
        EventName::ROOM_JOINED,
        json!({
            "room_id": room_id,
            "recent_messages": recent,
            "members": members,
        }),
    ))
}

/// Process `leave_room`.
pub async fn handle_leave(
    state: &AppState,
    session: &Session,
    payload: RoomPayload,
) -> Result<ServerMessage, CommandError> {
    let room_id = payload.room_id;

    if !session.remove_room(&room_id) {
        return Err(CommandError::NotAMember { room_id });
    }

    if !state
        .sessions
        .user_subscribed_elsewhere(&session.user_id, &room_id, &session.session_id)
    {
        if let Err(e) = state
            .kv
            .srem(&room_members_key(&room_id), &session.user_id)
            .await
        {
            // Disconnect teardown retries this removal.
            tracing::warn!(session_id = %session.session_id, %room_id, %e, "failed to remove subscriber entry");
        }
    }
    state
        .sessions
        .set_rooms(&session.session_id, session.rooms());

    state
        .fanout
        .dispatch(BroadcastPayload {
            room_id: room_id.clone(),
            event_name: EventName::USER_LEFT.to_string(),
            data: json!({
                "room_id": room_id,
                "user_id": session.user_id,
                "display_name": session.display_name,
            }),
            origin_session: Some(session.session_id.clone()),
        })
        .await;

    Ok(ServerMessage::reply(
        EventName::ROOM_LEFT,
        json!({ "room_id": room_id }),
    ))
}

/// Process `send_message`: rate limit, validate, persist (best-effort), fan
/// out to the room, and acknowledge to the sender.
pub async fn handle_send(
    state: &AppState,
    session: &Session,
    payload: SendMessagePayload,
) -> Result<ServerMessage, CommandError> {
    check_limit(state, session, Action::SendMessage)?;
    let room_id = payload.room_id;

    if !session.is_subscribed(&room_id) {
        return Err(CommandError::NotAMember { room_id });
    }

    if payload.kind != "text" {
        return Err(CommandError::Validation {
            message: format!("unsupported message type: {}", payload.kind),
        });
    }
    let content = payload.content.trim();
    if content.is_empty() {
        return Err(CommandError::Validation {
            message: "message content is required".to_string(),
        });
    }
    if content.len() > MAX_MESSAGE_LEN {
        return Err(CommandError::Validation {
            message: format!("message content must be {MAX_MESSAGE_LEN} bytes or fewer"),
        });
    }

    let message = Message {
        id: state.snowflake.generate(),
        room_id: room_id.clone(),
        user_id: session.user_id.clone(),
        display_name: session.display_name.clone(),
        content: content.to_string(),
        kind: payload.kind,
        created_at: Utc::now(),
    };

    // Realtime delivery is prioritized over durability: a failed append
    // degrades the ack and retries in the background, but the fan-out
    // happens regardless.
    let persisted = match state.messages.append(&message).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(message_id = message.id, %room_id, %e, "message persistence failed");
            spawn_append_retry(state.messages.clone(), message.clone());
            false
        }
    };

    let data = serde_json::to_value(&message).unwrap();
    state
        .fanout
        .dispatch(BroadcastPayload {
            room_id: room_id.clone(),
            event_name: EventName::MESSAGE_RECEIVED.to_string(),
            data,
            origin_session: Some(session.session_id.clone()),
        })
        .await;

    touch_presence(state, session, Some(&room_id)).await;

    let mut ack = json!({
        "message_id": message.id,
        "room_id": room_id,
        "created_at": message.created_at,
    });
    if !persisted {
        ack["warning"] = json!("persistence_degraded");
    }
    Ok(ServerMessage::reply(EventName::MESSAGE_SENT, ack))
}

/// Process `start_typing`. Invalid targets are silently ignored; only the
/// first signal inside the expiry window broadcasts.
pub async fn handle_start_typing(
    state: &AppState,
    session: &Session,
    payload: RoomPayload,
) -> Result<(), CommandError> {
    check_limit(state, session, Action::Typing)?;
    let room_id = payload.room_id;

    if !session.is_subscribed(&room_id) {
        return Ok(());
    }

    if state
        .typing
        .start(&room_id, &session.user_id, &session.display_name)
    {
        state
            .fanout
            .dispatch(BroadcastPayload {
                room_id: room_id.clone(),
                event_name: EventName::USER_TYPING.to_string(),
                data: json!({
                    "room_id": room_id,
                    "user_id": session.user_id,
                    "display_name": session.display_name,
                }),
                origin_session: Some(session.session_id.clone()),
            })
            .await;
    }

    touch_presence(state, session, Some(&room_id)).await;
    Ok(())
}

/// Process `stop_typing`. Idempotent; stopping without a live entry is a
/// no-op rather than an error.
pub async fn handle_stop_typing(
    state: &AppState,
    session: &Session,
    payload: RoomPayload,
) -> Result<(), CommandError> {
    if let Some(stopped) = state.typing.stop(&payload.room_id, &session.user_id) {
        broadcast_typing_stopped(state, &stopped, Some(&session.session_id)).await;
    }
    Ok(())
}

/// Process `update_presence`.
pub async fn handle_presence_update(
    state: &AppState,
    session: &Session,
    payload: PresencePayload,
) -> Result<ServerMessage, CommandError> {
    check_limit(state, session, Action::PresenceUpdate)?;

    if !presence::is_settable_status(&payload.status) {
        return Err(CommandError::Validation {
            message: format!("unknown presence status: {}", payload.status),
        });
    }

    let previous = state
        .presence
        .set_status(&session.user_id, &session.session_id, &payload.status)
        .await?;

    if previous != payload.status {
        for room_id in session.rooms() {
            state
                .fanout
                .dispatch(BroadcastPayload {
                    room_id: room_id.clone(),
                    event_name: EventName::PRESENCE_CHANGED.to_string(),
                    data: json!({
                        "room_id": room_id,
                        "user_id": session.user_id,
                        "display_name": session.display_name,
                        "status": payload.status,
                    }),
                    origin_session: Some(session.session_id.clone()),
                })
                .await;
        }
    }

    Ok(ServerMessage::reply(
        EventName::PRESENCE_UPDATED,
        json!({ "status": payload.status }),
    ))
}

/// Process `ping`.
pub async fn handle_ping(state: &AppState, session: &Session) -> ServerMessage {
    touch_presence(state, session, None).await;
    ServerMessage::reply(EventName::PONG, json!({ "server_time": Utc::now() }))
}

/// Disconnect teardown. Runs exactly once per session, after the event loop
/// exits for any reason. Presence removal happens before the `user_left`
/// notifications so a racing presence query never sees a departed user as
/// still online.
pub async fn teardown_session(state: &AppState, session: &Session) {
    for stopped in state.typing.stop_all_for_user(&session.user_id) {
        broadcast_typing_stopped(state, &stopped, Some(&session.session_id)).await;
    }

    let rooms = session.rooms();
    for room_id in &rooms {
        if !state
            .sessions
            .user_subscribed_elsewhere(&session.user_id, room_id, &session.session_id)
        {
            if let Err(e) = state
                .kv
                .srem(&room_members_key(room_id), &session.user_id)
                .await
            {
                tracing::warn!(session_id = %session.session_id, %room_id, %e, "failed to remove subscriber entry");
            }
        }
    }

    if !state
        .sessions
        .user_connected_elsewhere(&session.user_id, &session.session_id)
    {
        if let Err(e) = state.presence.clear(&session.user_id).await {
            tracing::warn!(session_id = %session.session_id, %e, "failed to delete presence record");
        }
    }

    for room_id in &rooms {
        state
            .fanout
            .dispatch(BroadcastPayload {
                room_id: room_id.clone(),
                event_name: EventName::USER_LEFT.to_string(),
                data: json!({
                    "room_id": room_id,
                    "user_id": session.user_id,
                    "display_name": session.display_name,
                }),
                origin_session: Some(session.session_id.clone()),
            })
            .await;
    }

    state.sessions.mark_disconnected(&session.session_id);
    state.limiter.forget_session(&session.session_id);
}

/// Broadcast a `user_stopped_typing` for an entry that ended. Shared by the
/// explicit stop, the expiry sweep, and disconnect teardown.
pub async fn broadcast_typing_stopped(
    state: &AppState,
    stopped: &super::typing::StoppedTyping,
    origin_session: Option<&str>,
) {
    state
        .fanout
        .dispatch(BroadcastPayload {
            room_id: stopped.room_id.clone(),
            event_name: EventName::USER_STOPPED_TYPING.to_string(),
            data: json!({
                "room_id": stopped.room_id,
                "user_id": stopped.user_id,
                "display_name": stopped.display_name,
            }),
            origin_session: origin_session.map(|s| s.to_string()),
        })
        .await;
}

fn check_limit(state: &AppState, session: &Session, action: Action) -> Result<(), CommandError> {
    state
        .limiter
        .check(&session.session_id, action)
        .map_err(|retry_after_secs| CommandError::RateLimited {
            action: action.name(),
            retry_after_secs,
        })
}

async fn touch_presence(state: &AppState, session: &Session, room_id: Option<&str>) {
    if let Err(e) = state
        .presence
        .refresh(&session.user_id, &session.session_id, room_id)
        .await
    {
        tracing::warn!(session_id = %session.session_id, %e, "failed to refresh presence record");
    }
}

fn spawn_append_retry(store: Arc<dyn MessageStore>, message: Message) {
    tokio::spawn(async move {
        for attempt in 1..=PERSIST_RETRY_ATTEMPTS {
            tokio::time::sleep(PERSIST_RETRY_DELAY).await;
            match store.append(&message).await {
                Ok(()) => {
                    tracing::debug!(message_id = message.id, attempt, "message persisted on retry");
                    return;
                }
                Err(e) => {
                    tracing::warn!(message_id = message.id, attempt, %e, "persistence retry failed");
                }
            }
        }
        tracing::error!(
            message_id = message.id,
            room_id = %message.room_id,
            "dropping message after failed persistence retries"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::JwtValidator;
    use crate::config::Config;
    use crate::gateway::fanout::NoopRelay;
    use crate::gateway::ratelimit::RateLimits;
    use crate::store::kv::MemoryStore;
    use crate::store::messages::MemoryMessageStore;
    use crate::store::rooms::MemoryRoomDirectory;

    fn test_config() -> Config {
        Config {
            port: 0,
            auth_secret: "test-secret".to_string(),
            presence_ttl_secs: 30,
            typing_expiry_secs: 3,
            heartbeat_interval_ms: 41250,
            rate_limits: RateLimits {
                sends_per_min: 3,
                ..RateLimits::default()
            },
            default_rooms: vec!["general".to_string()],
        }
    }

    fn test_state() -> AppState {
        let rooms = Arc::new(MemoryRoomDirectory::new());
        rooms.insert_public_room("general");
        rooms.insert_private_room("room_priv", &["usr_1"]);
        AppState::new(
            test_config(),
            Arc::new(JwtValidator::new("test-secret")),
            Arc::new(MemoryStore::new()),
            rooms,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(NoopRelay),
        )
    }

    fn test_session(state: &AppState, user_id: &str, name: &str) -> Session {
        let session = Session::new(
            banter_common::id::prefixed_ulid(banter_common::id::prefix::SESSION),
            user_id.to_string(),
            name.to_string(),
            HashSet::new(),
        );
        state.sessions.register(
            session.session_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            HashSet::new(),
        );
        session
    }

    fn room(room_id: &str) -> RoomPayload {
        RoomPayload {
            room_id: room_id.to_string(),
        }
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");

        let first = handle_join(&state, &session, room("general")).await.unwrap();
        assert_eq!(first.t, EventName::ROOM_JOINED);

        let second = handle_join(&state, &session, room("general")).await.unwrap();
        assert_eq!(second.t, EventName::ROOM_JOINED);

        // Exactly one subscriber-set entry.
        let members = state.kv.smembers(&room_members_key("general")).await.unwrap();
        assert_eq!(members, vec!["usr_1"]);
    }

    #[tokio::test]
    async fn join_unknown_room_fails() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");

        let err = handle_join(&state, &session, room("nope")).await.unwrap_err();
        assert_eq!(err.reason(), "room_not_found");
    }

    #[tokio::test]
    async fn join_private_room_requires_membership() {
        let state = test_state();
        let outsider = test_session(&state, "usr_2", "bob");

        let err = handle_join(&state, &outsider, room("room_priv"))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_a_member");

        let insider = test_session(&state, "usr_1", "alice");
        assert!(handle_join(&state, &insider, room("room_priv")).await.is_ok());
    }

    #[tokio::test]
    async fn leave_without_membership_fails() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");

        let err = handle_leave(&state, &session, room("general"))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_a_member");
    }

    #[tokio::test]
    async fn send_requires_subscription_and_has_no_side_effects_on_reject() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        let mut rx = state.fanout.subscribe();

        let err = handle_send(
            &state,
            &session,
            SendMessagePayload {
                room_id: "general".to_string(),
                content: "x".to_string(),
                kind: "text".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason(), "not_a_member");

        // Nothing fanned out, nothing persisted.
        assert!(rx.try_recv().is_err());
        assert!(state
            .messages
            .history("general", None, 50)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn send_validates_content() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();

        let oversized = "x".repeat(MAX_MESSAGE_LEN + 1);
        for content in ["", "   ", oversized.as_str()] {
            let err = handle_send(
                &state,
                &session,
                SendMessagePayload {
                    room_id: "general".to_string(),
                    content: content.to_string(),
                    kind: "text".to_string(),
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.reason(), "validation");
        }
    }

    #[tokio::test]
    async fn send_fans_out_and_acks() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();
        let mut rx = state.fanout.subscribe();

        let ack = handle_send(
            &state,
            &session,
            SendMessagePayload {
                room_id: "general".to_string(),
                content: "hi".to_string(),
                kind: "text".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(ack.t, EventName::MESSAGE_SENT);
        assert!(ack.d["message_id"].as_i64().unwrap() > 0);
        assert!(ack.d.get("warning").is_none());

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.event_name, EventName::MESSAGE_RECEIVED);
        assert_eq!(payload.data["content"], "hi");
        assert_eq!(
            payload.origin_session.as_deref(),
            Some(session.session_id.as_str())
        );

        // Persisted once.
        let history = state.messages.history("general", None, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn rate_limited_send_mutates_nothing() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();

        for _ in 0..3 {
            handle_send(
                &state,
                &session,
                SendMessagePayload {
                    room_id: "general".to_string(),
                    content: "hi".to_string(),
                    kind: "text".to_string(),
                },
            )
            .await
            .unwrap();
        }

        let mut rx = state.fanout.subscribe();
        let err = handle_send(
            &state,
            &session,
            SendMessagePayload {
                room_id: "general".to_string(),
                content: "one too many".to_string(),
                kind: "text".to_string(),
            },
        )
        .await
        .unwrap_err();

        match err {
            CommandError::RateLimited {
                action,
                retry_after_secs,
            } => {
                assert_eq!(action, "send_message");
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        assert!(rx.try_recv().is_err());
        assert_eq!(
            state.messages.history("general", None, 50).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn typing_broadcasts_once_per_window() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();
        let mut rx = state.fanout.subscribe();

        handle_start_typing(&state, &session, room("general"))
            .await
            .unwrap();
        handle_start_typing(&state, &session, room("general"))
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.event_name, EventName::USER_TYPING);
        // The second start refreshed without re-broadcasting.
        assert!(rx.try_recv().is_err());

        handle_stop_typing(&state, &session, room("general"))
            .await
            .unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.event_name, EventName::USER_STOPPED_TYPING);

        // Stop again: idempotent, no second broadcast.
        handle_stop_typing(&state, &session, room("general"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_in_unjoined_room_is_silently_ignored() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        let mut rx = state.fanout.subscribe();

        handle_start_typing(&state, &session, room("general"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(state.typing.is_empty());
    }

    #[tokio::test]
    async fn presence_update_broadcasts_to_joined_rooms() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();
        state
            .presence
            .set_online(&session.user_id, &session.session_id)
            .await
            .unwrap();
        let mut rx = state.fanout.subscribe();

        let reply = handle_presence_update(
            &state,
            &session,
            PresencePayload {
                status: "away".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.t, EventName::PRESENCE_UPDATED);

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.event_name, EventName::PRESENCE_CHANGED);
        assert_eq!(payload.data["status"], "away");

        // Setting the same status again changes nothing, so no broadcast.
        handle_presence_update(
            &state,
            &session,
            PresencePayload {
                status: "away".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_update_rejects_unknown_status() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");

        let err = handle_presence_update(
            &state,
            &session,
            PresencePayload {
                status: "offline".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason(), "validation");
    }

    #[tokio::test]
    async fn teardown_cleans_rooms_presence_and_typing() {
        let state = test_state();
        let session = test_session(&state, "usr_1", "alice");
        handle_join(&state, &session, room("general")).await.unwrap();
        handle_join(&state, &session, room("room_priv")).await.unwrap();
        handle_start_typing(&state, &session, room("general"))
            .await
            .unwrap();

        let mut rx = state.fanout.subscribe();
        teardown_session(&state, &session).await;

        // Typing stop first, then one user_left per room.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_name, EventName::USER_STOPPED_TYPING);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_name, EventName::USER_LEFT);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.event_name, EventName::USER_LEFT);

        // Subscriber sets, presence, and typing are all clean.
        assert!(state
            .kv
            .smembers(&room_members_key("general"))
            .await
            .unwrap()
            .is_empty());
        assert!(state
            .kv
            .smembers(&room_members_key("room_priv"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            state.presence.status_of("usr_1").await.unwrap(),
            presence::STATUS_OFFLINE
        );
        assert!(state.typing.is_empty());
    }

    #[tokio::test]
    async fn teardown_keeps_shared_state_while_another_session_lives() {
        let state = test_state();
        let s1 = test_session(&state, "usr_1", "alice");
        let s2 = test_session(&state, "usr_1", "alice");
        handle_join(&state, &s1, room("general")).await.unwrap();
        handle_join(&state, &s2, room("general")).await.unwrap();
        state
            .presence
            .set_online("usr_1", &s1.session_id)
            .await
            .unwrap();

        teardown_session(&state, &s1).await;

        // The second session still holds the room and the presence record.
        assert_eq!(
            state.kv.smembers(&room_members_key("general")).await.unwrap(),
            vec!["usr_1"]
        );
        assert_eq!(
            state.presence.status_of("usr_1").await.unwrap(),
            presence::STATUS_ONLINE
        );
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_token() {
        let state = test_state();
        let err = handle_authenticate(
            &state,
            AuthenticatePayload {
                token: "garbage".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, "Invalid or expired token");
    }

    #[tokio::test]
    async fn authenticate_restores_memberships() {
        let state = test_state();
        let token = crate::auth::tokens::tests_support::mint("test-secret", "usr_1", "alice");

        let (session, ready) = handle_authenticate(
            &state,
            AuthenticatePayload { token },
        )
        .await
        .unwrap();

        assert!(session.is_subscribed("room_priv"));
        assert_eq!(ready.t, EventName::READY);
        assert_eq!(ready.d["degraded"], false);
        assert_eq!(ready.d["rooms"][0], "room_priv");
        assert_eq!(
            state.presence.status_of("usr_1").await.unwrap(),
            presence::STATUS_ONLINE
        );
        assert_eq!(
            state.kv.smembers(&room_members_key("room_priv")).await.unwrap(),
            vec!["usr_1"]
        );
    }
}
