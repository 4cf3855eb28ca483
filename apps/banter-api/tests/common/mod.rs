#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time;
use tokio_tungstenite::tungstenite;

use banter_api::auth::tokens::JwtValidator;
use banter_api::config::Config;
use banter_api::error::StoreError;
use banter_api::gateway::fanout::NoopRelay;
use banter_api::gateway::ratelimit::RateLimits;
use banter_api::store::kv::MemoryStore;
use banter_api::store::messages::{MemoryMessageStore, Message, MessageStore};
use banter_api::store::rooms::{MemoryRoomDirectory, RoomDirectory};
use banter_api::AppState;

pub const TEST_SECRET: &str = "gateway-test-secret";

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config() -> Config {
    Config {
        port: 0,
        auth_secret: TEST_SECRET.to_string(),
        presence_ttl_secs: 30,
        typing_expiry_secs: 1,
        heartbeat_interval_ms: 41250,
        rate_limits: RateLimits::default(),
        default_rooms: vec!["general".to_string()],
    }
}

/// Room directory used by most tests: a public room plus a private one that
/// only `usr_alice` holds a membership row in.
pub fn default_rooms_dir() -> Arc<MemoryRoomDirectory> {
    let rooms = Arc::new(MemoryRoomDirectory::new());
    rooms.insert_public_room("general");
    rooms.insert_private_room("private-1", &["usr_alice"]);
    rooms
}

pub fn build_state(
    config: Config,
    messages: Arc<dyn MessageStore>,
    rooms: Arc<dyn RoomDirectory>,
) -> AppState {
    AppState::new(
        config,
        Arc::new(JwtValidator::new(TEST_SECRET)),
        Arc::new(MemoryStore::new()),
        rooms,
        messages,
        Arc::new(NoopRelay),
    )
}

pub fn test_state() -> AppState {
    build_state(
        test_config(),
        Arc::new(MemoryMessageStore::new()),
        default_rooms_dir(),
    )
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = Router::new()
        .merge(banter_api::routes::router())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Mint a connect token the way the external auth service would.
pub fn mint_token(user_id: &str, display_name: &str) -> String {
    use jsonwebtoken::{Algorithm, EncodingKey, Header};

    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        name: String,
        exp: i64,
    }

    let claims = Claims {
        sub: user_id.to_string(),
        name: display_name.to_string(),
        exp: chrono::Utc::now().timestamp() + 300,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/gateway");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_op(ws: &mut WsStream, op: &str, d: Value) {
    let frame = json!({ "op": op, "d": d }).to_string();
    ws.send(tungstenite::Message::Text(frame.into()))
        .await
        .expect("send op");
}

/// Read the next JSON event, skipping transport ping/pong frames.
pub async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse event")
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read events until one with the given name arrives, returning it.
pub async fn next_event_named(ws: &mut WsStream, name: &str) -> Value {
    loop {
        let event = next_json(ws).await;
        if event["t"] == name {
            return event;
        }
    }
}

/// Expect a close frame with the given application close code.
pub async fn expect_close(ws: &mut WsStream, code: u16) {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tungstenite::protocol::frame::coding::CloseCode::from(code)
                );
                return;
            }
            tungstenite::Message::Close(None) => return, // Also acceptable.
            tungstenite::Message::Text(_) => continue,   // Drain pending events.
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("expected Close frame, got: {other:?}"),
        }
    }
}

/// Connect and complete the authenticate handshake. Returns the stream and
/// the `ready` event.
pub async fn connect_and_authenticate(addr: SocketAddr, token: &str) -> (WsStream, Value) {
    let mut ws = connect(addr).await;
    send_op(&mut ws, "authenticate", json!({ "token": token })).await;
    let ready = next_json(&mut ws).await;
    assert_eq!(ready["t"], "ready", "expected ready, got: {ready}");
    (ws, ready)
}

pub async fn join_room(ws: &mut WsStream, room_id: &str) -> Value {
    send_op(ws, "join_room", json!({ "room_id": room_id })).await;
    next_event_named(ws, "room_joined").await
}

// ---------------------------------------------------------------------------
// Failing collaborators for degraded-mode tests
// ---------------------------------------------------------------------------

/// A room directory whose backing store is down.
pub struct FailingRoomDirectory;

#[async_trait]
impl RoomDirectory for FailingRoomDirectory {
    async fn room_exists(&self, _room_id: &str) -> Result<bool, StoreError> {
        Err(StoreError::backend("room store unavailable"))
    }

    async fn is_member(&self, _user_id: &str, _room_id: &str) -> Result<bool, StoreError> {
        Err(StoreError::backend("room store unavailable"))
    }

    async fn list_user_rooms(&self, _user_id: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::backend("room store unavailable"))
    }
}

/// A message store that accepts reads but fails every write.
pub struct WriteFailingMessageStore;

#[async_trait]
impl MessageStore for WriteFailingMessageStore {
    async fn append(&self, _message: &Message) -> Result<(), StoreError> {
        Err(StoreError::backend("message store unavailable"))
    }

    async fn history(
        &self,
        _room_id: &str,
        _before: Option<i64>,
        _limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }
}
