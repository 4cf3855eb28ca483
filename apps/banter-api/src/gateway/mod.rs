pub mod events;
pub mod fanout;
pub mod handler;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod resume;
pub mod server;
pub mod session;
pub mod typing;

/// Key holding the subscriber set for a room in the shared store.
pub(crate) fn room_members_key(room_id: &str) -> String {
    format!("room:members:{room_id}")
}
