use crate::gateway::ratelimit::RateLimits;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the server binds to.
    pub port: u16,
    /// HMAC secret for verifying client auth tokens.
    pub auth_secret: String,
    /// Presence record time-to-live in the shared store (seconds).
    pub presence_ttl_secs: u64,
    /// Typing indicator inactivity window (seconds).
    pub typing_expiry_secs: u64,
    /// Heartbeat interval advertised to clients (milliseconds).
    pub heartbeat_interval_ms: u64,
    /// Per-action rate limit thresholds (per-minute windows).
    pub rate_limits: RateLimits,
    /// Rooms seeded into the room directory at startup.
    pub default_rooms: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            port: var_or("PORT", 4010),
            auth_secret: required_var("AUTH_SECRET"),
            presence_ttl_secs: var_or("PRESENCE_TTL_SECS", 30),
            typing_expiry_secs: var_or("TYPING_EXPIRY_SECS", 3),
            heartbeat_interval_ms: var_or("HEARTBEAT_INTERVAL_MS", 41250),
            rate_limits: RateLimits {
                sends_per_min: var_or("RATE_LIMIT_SENDS_PER_MIN", 30),
                joins_per_min: var_or("RATE_LIMIT_JOINS_PER_MIN", 10),
                typing_per_min: var_or("RATE_LIMIT_TYPING_PER_MIN", 60),
                presence_per_min: var_or("RATE_LIMIT_PRESENCE_PER_MIN", 10),
            },
            default_rooms: std::env::var("DEFAULT_ROOMS")
                .unwrap_or_else(|_| "general".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
