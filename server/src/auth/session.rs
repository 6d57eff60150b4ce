//! Opaque session tokens backed by the `sessions` table.
//!
//! The client holds a random 32-byte hex token in the `session_token` cookie;
//! the database only stores its SHA-256 hash with an expiry. The same
//! validation path serves REST handlers and the WebSocket upgrade.

use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbPool;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session_token";

/// A validated user, produced once at the authentication boundary and passed
/// explicitly to everything downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user_id: i64,
    pub nickname: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing, invalid or expired session")]
    Unauthenticated,

    #[error("session store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Generate a session token.
/// Returns (token_string, sha256_hash_hex). The hash is stored, the token goes to the client.
pub fn issue_session_token() -> (String, String) {
    let token_bytes: [u8; 32] = rand::rng().random();
    let token = hex::encode(token_bytes);
    let hash = hash_session_token(&token);
    (token, hash)
}

/// SHA-256 hash of a session token for storage comparison.
pub fn hash_session_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create a session for `user_id` valid for `ttl`, returning the plaintext token.
/// Expired sessions of the same user are purged first.
pub fn create_session(
    conn: &Connection,
    user_id: i64,
    ttl: Duration,
) -> Result<String, rusqlite::Error> {
    let now = Utc::now();

    conn.execute(
        "DELETE FROM sessions WHERE user_id = ?1 AND expires_at <= ?2",
        rusqlite::params![user_id, now.to_rfc3339()],
    )?;

    let (token, token_hash) = issue_session_token();
    conn.execute(
        "INSERT INTO sessions (id, user_id, token_hash, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            Uuid::now_v7().to_string(),
            user_id,
            token_hash,
            (now + ttl).to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;

    Ok(token)
}

/// Resolve a session token to the user it belongs to.
pub fn validate_session(conn: &Connection, token: &str) -> Result<Identity, AuthError> {
    if token.is_empty() {
        return Err(AuthError::Unauthenticated);
    }

    let token_hash = hash_session_token(token);
    let now = Utc::now().to_rfc3339();

    conn.query_row(
        "SELECT u.id, u.nickname
         FROM sessions s
         JOIN users u ON s.user_id = u.id
         WHERE s.token_hash = ?1 AND s.expires_at > ?2",
        rusqlite::params![token_hash, now],
        |row| {
            Ok(Identity {
                user_id: row.get(0)?,
                nickname: row.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or(AuthError::Unauthenticated)
}

/// Delete the session behind `token`. Returns whether a session existed.
pub fn revoke_session(conn: &Connection, token: &str) -> Result<bool, rusqlite::Error> {
    let rows = conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        rusqlite::params![hash_session_token(token)],
    )?;
    Ok(rows > 0)
}

/// Async wrapper around [`validate_session`] for use from request handlers.
pub async fn validate_token(db: &DbPool, token: String) -> Result<Identity, AuthError> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| AuthError::Unavailable("database lock poisoned".to_string()))?;
        validate_session(&conn, &token)
    })
    .await
    .map_err(|e| AuthError::Unavailable(e.to_string()))?
}

/// Session token from a request's `Cookie` header, if present.
pub fn token_from_headers(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|header| token_from_cookie_header(header, SESSION_COOKIE))
}

/// Find a cookie value in a raw `Cookie:` header.
pub fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}
