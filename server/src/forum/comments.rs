use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::session::Identity;
use crate::error::{lock_db, ApiError};
use crate::forum::posts::CreatedResponse;
use crate::state::AppState;

pub const MAX_COMMENT_LENGTH: usize = 2_000;

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub post_id: i64,
    pub content: String,
}

/// Insert a comment. Returns `None` when the post does not exist.
pub fn insert_comment(
    conn: &Connection,
    post_id: i64,
    user_id: i64,
    content: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    let post_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM posts WHERE id = ?1)",
        [post_id],
        |row| row.get(0),
    )?;
    if !post_exists {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO comments (post_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![post_id, user_id, content, Utc::now().to_rfc3339()],
    )?;
    Ok(Some(conn.last_insert_rowid()))
}

/// POST /api/comments
pub async fn create_comment(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::bad_request("Comment cannot be empty"));
    }
    if content.chars().count() > MAX_COMMENT_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Comment exceeds {} characters",
            MAX_COMMENT_LENGTH
        )));
    }

    let db = state.db.clone();
    let post_id = req.post_id;
    let user_id = identity.user_id;

    let comment_id = tokio::task::spawn_blocking(move || -> Result<i64, ApiError> {
        let conn = lock_db(&db)?;
        insert_comment(&conn, post_id, user_id, &content)?
            .ok_or_else(|| ApiError::not_found(format!("post {} does not exist", post_id)))
    })
    .await??;

    tracing::info!(user_id, post_id, comment_id, "Comment created");

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: comment_id })))
}
