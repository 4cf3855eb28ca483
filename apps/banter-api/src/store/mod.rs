pub mod kv;
pub mod messages;
pub mod rooms;
