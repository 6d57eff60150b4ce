//! Like/dislike toggling on posts and comments.
//!
//! A reaction is a tri-state relation between a user and a piece of content:
//! no row means neutral, otherwise the row's `liked` flag decides. Every
//! change runs inside one IMMEDIATE transaction, so concurrent toggles of the
//! same triple serialize on SQLite's write lock.

use std::fmt;

use axum::{extract::State, Json};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::session::Identity;
use crate::error::{lock_db, ApiError};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Post,
    Comment,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Comment => "comments",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionState {
    None,
    Liked,
    Disliked,
}

impl ReactionState {
    fn from_row(liked: Option<bool>) -> Self {
        match liked {
            Some(true) => Self::Liked,
            Some(false) => Self::Disliked,
            None => Self::None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("{content_type} {content_id} does not exist")]
    ContentNotFound {
        content_type: ContentType,
        content_id: i64,
    },

    #[error("reaction store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Pure transition: repeating the current reaction clears it, anything else
/// switches to the requested one.
pub fn next_state(current: ReactionState, wants_liked: bool) -> ReactionState {
    match (current, wants_liked) {
        (ReactionState::Liked, true) | (ReactionState::Disliked, false) => ReactionState::None,
        (_, true) => ReactionState::Liked,
        (_, false) => ReactionState::Disliked,
    }
}

/// Apply one toggle for `user_id` and return the resulting state.
///
/// Fails with `ContentNotFound` before touching any row when the target does
/// not exist. On any store error the transaction is dropped and rolled back.
pub fn apply_reaction(
    conn: &mut Connection,
    content_type: ContentType,
    content_id: i64,
    user_id: i64,
    wants_liked: bool,
) -> Result<ReactionState, ReactionError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let exists: bool = tx.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)",
            content_type.table()
        ),
        [content_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(ReactionError::ContentNotFound {
            content_type,
            content_id,
        });
    }

    let current: Option<bool> = tx
        .query_row(
            "SELECT liked FROM reactions
             WHERE content_type = ?1 AND content_id = ?2 AND user_id = ?3",
            rusqlite::params![content_type.as_str(), content_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    let current = ReactionState::from_row(current);
    let next = next_state(current, wants_liked);

    match (current, next) {
        (_, ReactionState::None) => {
            tx.execute(
                "DELETE FROM reactions
                 WHERE content_type = ?1 AND content_id = ?2 AND user_id = ?3",
                rusqlite::params![content_type.as_str(), content_id, user_id],
            )?;
        }
        (ReactionState::None, _) => {
            tx.execute(
                "INSERT INTO reactions (content_type, content_id, user_id, liked, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    content_type.as_str(),
                    content_id,
                    user_id,
                    wants_liked,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        _ => {
            tx.execute(
                "UPDATE reactions SET liked = ?4
                 WHERE content_type = ?1 AND content_id = ?2 AND user_id = ?3",
                rusqlite::params![content_type.as_str(), content_id, user_id, wants_liked],
            )?;
        }
    }

    tx.commit()?;
    Ok(next)
}

/// (likes, dislikes) for one piece of content.
pub fn reaction_counts(
    conn: &Connection,
    content_type: ContentType,
    content_id: i64,
) -> Result<(i64, i64), rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(SUM(liked = 1), 0), COALESCE(SUM(liked = 0), 0)
         FROM reactions WHERE content_type = ?1 AND content_id = ?2",
        rusqlite::params![content_type.as_str(), content_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

/// The viewer's own reaction to a piece of content.
pub fn reaction_of(
    conn: &Connection,
    content_type: ContentType,
    content_id: i64,
    user_id: i64,
) -> Result<ReactionState, rusqlite::Error> {
    let liked: Option<bool> = conn
        .query_row(
            "SELECT liked FROM reactions
             WHERE content_type = ?1 AND content_id = ?2 AND user_id = ?3",
            rusqlite::params![content_type.as_str(), content_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ReactionState::from_row(liked))
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub content_type: ContentType,
    pub content_id: i64,
    pub liked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReactResponse {
    pub content_type: ContentType,
    pub content_id: i64,
    pub state: ReactionState,
    pub likes: i64,
    pub dislikes: i64,
}

/// POST /api/reactions
pub async fn react(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ReactRequest>,
) -> Result<Json<ReactResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = identity.user_id;

    let response = tokio::task::spawn_blocking(move || -> Result<ReactResponse, ApiError> {
        let mut conn = lock_db(&db)?;
        let next = apply_reaction(&mut conn, req.content_type, req.content_id, user_id, req.liked)?;
        let (likes, dislikes) = reaction_counts(&conn, req.content_type, req.content_id)?;
        Ok(ReactResponse {
            content_type: req.content_type,
            content_id: req.content_id,
            state: next,
            likes,
            dislikes,
        })
    })
    .await??;

    tracing::debug!(
        user_id,
        content_type = %response.content_type,
        content_id = response.content_id,
        state = ?response.state,
        "Reaction applied"
    );

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory store with one user, one post (id 1) and one comment (id 1).
    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrations().to_latest(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO users (first_name, last_name, email, gender, age, nickname, password_hash, created_at)
             VALUES ('Ada', 'L', 'ada@example.com', 'f', 36, 'ada', 'x', 'now');
             INSERT INTO posts (user_id, title, content, created_at) VALUES (1, 't', 'c', 'now');
             INSERT INTO comments (post_id, user_id, content, created_at) VALUES (1, 1, 'c', 'now');",
        )
        .unwrap();
        conn
    }

    fn row_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM reactions", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_transition_table() {
        use ReactionState::*;
        assert_eq!(next_state(None, true), Liked);
        assert_eq!(next_state(None, false), Disliked);
        assert_eq!(next_state(Liked, true), None);
        assert_eq!(next_state(Disliked, false), None);
        assert_eq!(next_state(Liked, false), Disliked);
        assert_eq!(next_state(Disliked, true), Liked);
    }

    #[test]
    fn test_like_twice_returns_to_neutral() {
        let mut conn = seeded();
        let first = apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        assert_eq!(first, ReactionState::Liked);
        assert_eq!(row_count(&conn), 1);

        let second = apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        assert_eq!(second, ReactionState::None);
        assert_eq!(row_count(&conn), 0);
        assert_eq!(reaction_counts(&conn, ContentType::Post, 1).unwrap(), (0, 0));
    }

    #[test]
    fn test_dislike_twice_returns_to_neutral() {
        let mut conn = seeded();
        apply_reaction(&mut conn, ContentType::Comment, 1, 1, false).unwrap();
        let state = apply_reaction(&mut conn, ContentType::Comment, 1, 1, false).unwrap();
        assert_eq!(state, ReactionState::None);
        assert_eq!(row_count(&conn), 0);
    }

    #[test]
    fn test_switching_updates_in_place() {
        let mut conn = seeded();
        apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();

        let state = apply_reaction(&mut conn, ContentType::Post, 1, 1, false).unwrap();
        assert_eq!(state, ReactionState::Disliked);
        assert_eq!(row_count(&conn), 1);
        assert_eq!(reaction_counts(&conn, ContentType::Post, 1).unwrap(), (0, 1));

        let state = apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        assert_eq!(state, ReactionState::Liked);
        assert_eq!(row_count(&conn), 1);
        assert_eq!(reaction_counts(&conn, ContentType::Post, 1).unwrap(), (1, 0));
    }

    #[test]
    fn test_post_and_comment_reactions_are_independent() {
        let mut conn = seeded();
        apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        apply_reaction(&mut conn, ContentType::Comment, 1, 1, false).unwrap();

        assert_eq!(reaction_of(&conn, ContentType::Post, 1, 1).unwrap(), ReactionState::Liked);
        assert_eq!(
            reaction_of(&conn, ContentType::Comment, 1, 1).unwrap(),
            ReactionState::Disliked
        );
        assert_eq!(row_count(&conn), 2);
    }

    #[test]
    fn test_missing_content_is_rejected_without_writes() {
        let mut conn = seeded();
        let err = apply_reaction(&mut conn, ContentType::Post, 42, 1, true).unwrap_err();
        assert!(matches!(
            err,
            ReactionError::ContentNotFound {
                content_type: ContentType::Post,
                content_id: 42
            }
        ));

        let err = apply_reaction(&mut conn, ContentType::Comment, 7, 1, false).unwrap_err();
        assert_eq!(err.to_string(), "comment 7 does not exist");
        assert_eq!(row_count(&conn), 0);
    }

    #[test]
    fn test_counts_span_users() {
        let mut conn = seeded();
        conn.execute(
            "INSERT INTO users (first_name, last_name, email, gender, age, nickname, password_hash, created_at)
             VALUES ('Bo', 'B', 'bo@example.com', 'm', 30, 'bo', 'x', 'now')",
            [],
        )
        .unwrap();

        apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        apply_reaction(&mut conn, ContentType::Post, 1, 2, false).unwrap();
        assert_eq!(reaction_counts(&conn, ContentType::Post, 1).unwrap(), (1, 1));
    }

    #[test]
    fn test_concurrent_toggles_never_duplicate_rows() {
        const THREADS: usize = 8;
        const TOGGLES: usize = 25;

        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap().to_string();
        {
            let db = crate::db::init_db(&data_dir).unwrap();
            let conn = db.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO users (first_name, last_name, email, gender, age, nickname, password_hash, created_at)
                 VALUES ('Ada', 'L', 'ada@example.com', 'f', 36, 'ada', 'x', 'now');
                 INSERT INTO posts (user_id, title, content, created_at) VALUES (1, 't', 'c', 'now');",
            )
            .unwrap();
        }
        let db_path = dir.path().join("forum.db");

        // One connection per thread so the transactions really contend
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let db_path = db_path.clone();
                std::thread::spawn(move || {
                    let mut conn = Connection::open(&db_path).unwrap();
                    conn.busy_timeout(std::time::Duration::from_secs(30)).unwrap();
                    for _ in 0..TOGGLES {
                        apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
                        assert!(row_count(&conn) <= 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // THREADS * TOGGLES is even, so the likes cancel out
        let mut conn = Connection::open(&db_path).unwrap();
        assert_eq!(row_count(&conn), 0);
        assert_eq!(reaction_of(&conn, ContentType::Post, 1, 1).unwrap(), ReactionState::None);

        let state = apply_reaction(&mut conn, ContentType::Post, 1, 1, true).unwrap();
        assert_eq!(state, ReactionState::Liked);
        assert_eq!(row_count(&conn), 1);
        assert_eq!(reaction_counts(&conn, ContentType::Post, 1).unwrap(), (1, 0));
    }
}
