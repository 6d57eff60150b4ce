use axum::{
    extract::{State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use crate::auth::session::{self, Identity};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Authenticates via the session cookie before
/// upgrading: a caller without a valid session gets a plain 401 and no
/// connection is ever created.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = session::token_from_headers(&headers) else {
        tracing::warn!("WebSocket upgrade without session cookie");
        return ApiError::unauthorized("missing session cookie").into_response();
    };

    match session::validate_token(&state.db, token.to_string()).await {
        Ok(identity) => {
            tracing::info!(
                user_id = identity.user_id,
                nickname = %identity.nickname,
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| handle_authenticated(socket, state, identity))
        }
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket auth failed");
            ApiError::from(err).into_response()
        }
    }
}

async fn handle_authenticated(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    identity: Identity,
) {
    actor::run_connection(socket, state, identity).await;
}
