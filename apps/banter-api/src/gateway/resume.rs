//! Resume handler — validates the token, looks up the disconnected session,
//! restores its shared state, and returns the events to replay.

use crate::AppState;

use super::events::ResumePayload;
use super::registry::ReplayEntry;
use super::room_members_key;
use super::session::Session;

/// Process a `resume` op.
///
/// On success, returns a reconstructed `Session` and the list of events to
/// replay (everything the client missed since `payload.last_seq`).
///
/// On failure, returns a static error string that the caller sends as a
/// `reconnect` message before closing, telling the client to authenticate
/// from scratch.
pub async fn handle_resume(
    state: &AppState,
    payload: ResumePayload,
) -> Result<(Session, Vec<ReplayEntry>), &'static str> {
    // 1. Validate the token.
    let user = state
        .auth
        .verify(&payload.token)
        .await
        .ok_or("Invalid or expired token")?;

    // 2. Look up the session in the registry.
    let (session_user_id, display_name, rooms, seq) = state
        .sessions
        .get_session_info(&payload.session_id)
        .ok_or("Session not found")?;

    // 3. Verify the token's user matches the session's user.
    if user.user_id != session_user_id {
        return Err("Token user mismatch");
    }

    // 4. Replay events after the client's last seq.
    let replay = state
        .sessions
        .replay_after(&payload.session_id, payload.last_seq)
        .ok_or("Replay window expired — please authenticate")?;

    // 5. Re-establish the shared state that disconnect teardown removed.
    for room_id in &rooms {
        if let Err(e) = state
            .kv
            .sadd(&room_members_key(room_id), &session_user_id)
            .await
        {
            tracing::warn!(session_id = %payload.session_id, %room_id, %e, "failed to restore subscriber entry");
        }
    }
    if let Err(e) = state
        .presence
        .set_online(&session_user_id, &payload.session_id)
        .await
    {
        tracing::warn!(session_id = %payload.session_id, %e, "failed to write presence record");
    }

    // 6. Mark the session as connected again.
    state.sessions.mark_connected(&payload.session_id);

    let session = Session::with_seq(
        payload.session_id.clone(),
        session_user_id,
        display_name,
        rooms,
        seq,
    );

    Ok((session, replay))
}
