pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use auth::tokens::AuthValidator;
use banter_common::SnowflakeGenerator;
use config::Config;
use gateway::fanout::{EventRelay, Fanout};
use gateway::presence::PresenceTracker;
use gateway::ratelimit::RateLimiter;
use gateway::registry::SessionRegistry;
use gateway::typing::TypingCoordinator;
use store::kv::KeyValueStore;
use store::messages::MessageStore;
use store::rooms::RoomDirectory;

/// Shared application state. Every component is constructed explicitly and
/// injected here — there are no process-wide singletons, and dropping the
/// state after the server and sweeper finish is the shutdown sequence.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn AuthValidator>,
    pub kv: Arc<dyn KeyValueStore>,
    pub rooms: Arc<dyn RoomDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub snowflake: Arc<SnowflakeGenerator>,
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingCoordinator>,
    pub limiter: Arc<RateLimiter>,
    pub fanout: Fanout,
}

impl AppState {
    /// Wire up the coordination core around the injected collaborators.
    pub fn new(
        config: Config,
        auth: Arc<dyn AuthValidator>,
        kv: Arc<dyn KeyValueStore>,
        rooms: Arc<dyn RoomDirectory>,
        messages: Arc<dyn MessageStore>,
        relay: Arc<dyn EventRelay>,
    ) -> Self {
        let presence = Arc::new(PresenceTracker::new(kv.clone(), config.presence_ttl_secs));
        let typing = Arc::new(TypingCoordinator::new(Duration::from_secs(
            config.typing_expiry_secs,
        )));
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));

        Self {
            config: Arc::new(config),
            auth,
            kv,
            rooms,
            messages,
            snowflake: Arc::new(SnowflakeGenerator::new(0)),
            sessions: Arc::new(SessionRegistry::new()),
            presence,
            typing,
            limiter,
            fanout: Fanout::new(relay),
        }
    }
}
