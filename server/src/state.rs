use crate::config::RealtimeConfig;
use crate::db::DbPool;
use crate::ws::hub::HubHandle;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Handle to the real-time hub's control loop
    pub hub: HubHandle,
    /// Session lifetime in hours
    pub session_ttl_hours: i64,
    /// Whether the session cookie carries the Secure flag
    pub secure_cookies: bool,
    /// Throttling applied to the auth endpoints
    pub auth_rate_limit: AuthRateLimit,
    /// WebSocket connection tuning
    pub realtime: RealtimeConfig,
}

/// Per-IP token bucket for /api/auth/*.
#[derive(Debug, Clone, Copy)]
pub struct AuthRateLimit {
    pub burst_size: u32,
    pub replenish_secs: u64,
}

impl Default for AuthRateLimit {
    fn default() -> Self {
        Self {
            burst_size: 5,
            replenish_secs: 12,
        }
    }
}
