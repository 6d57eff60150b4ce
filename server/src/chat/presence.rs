//! User directory and online presence.
//!
//! Presence itself lives in the hub; this module only exposes it over REST.

use axum::{extract::State, Json};
use rusqlite::Connection;

use crate::auth::session::Identity;
use crate::error::{lock_db, ApiError};
use crate::state::AppState;
use crate::ws::protocol::OnlineUser;

/// Every registered user, ordered by nickname.
pub fn all_users(conn: &Connection) -> Result<Vec<OnlineUser>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id, nickname FROM users ORDER BY nickname COLLATE NOCASE")?;
    let rows = stmt.query_map([], |row| {
        Ok(OnlineUser {
            id: row.get(0)?,
            nickname: row.get(1)?,
        })
    })?;
    rows.collect()
}

/// GET /api/users
pub async fn list_users(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<OnlineUser>>, ApiError> {
    let db = state.db.clone();
    let users = tokio::task::spawn_blocking(move || {
        let conn = lock_db(&db)?;
        Ok::<_, ApiError>(all_users(&conn)?)
    })
    .await??;

    Ok(Json(users))
}

/// GET /api/users/online
pub async fn online_users(State(state): State<AppState>, _identity: Identity) -> Json<Vec<OnlineUser>> {
    Json(state.hub.online_users())
}
