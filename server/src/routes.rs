use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::handlers as auth;
use crate::chat::{messages, presence};
use crate::forum::{comments, posts, reactions};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`:
/// the auth rate limiter keys on the peer IP.
pub fn build_router(state: AppState) -> Router {
    let limit = state.auth_rate_limit;
    // Zero would make the builder reject the config
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(limit.replenish_secs.max(1))
            .burst_size(limit.burst_size.max(1))
            .finish()
            .expect("governor config with non-zero period and burst"),
    );

    // Spawn background task to clean up rate limiter state
    let limiter = governor_config.limiter().clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            limiter.retain_recent();
        }
    });

    // Auth routes with per-IP rate limiting
    let auth_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Session required (Identity extractor validates the cookie)
    let authenticated_routes = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/posts", get(posts::list).post(posts::create_post))
        .route("/api/posts/{id}", get(posts::get_post))
        .route("/api/comments", post(comments::create_comment))
        .route("/api/categories", get(posts::list_categories))
        .route("/api/reactions", post(reactions::react))
        .route("/api/messages", get(messages::history).post(messages::send_message))
        .route("/api/users", get(presence::list_users))
        .route("/api/users/online", get(presence::online_users));

    // WebSocket endpoint (cookie checked before the upgrade)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(authenticated_routes)
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
