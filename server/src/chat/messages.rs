//! REST endpoints for private messages.
//!
//! Messages sent here are stored first and then fanned out through the hub
//! as a regular `chat_message` envelope, so live clients see them exactly
//! like frames sent over the socket.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::session::Identity;
use crate::db::models::MessageRow;
use crate::error::{lock_db, ApiError};
use crate::state::AppState;
use crate::ws::protocol::{ChatMessage, Envelope, MAX_CHAT_LENGTH};

/// Default page size for message history.
const DEFAULT_LIMIT: u32 = 50;
/// Maximum page size for message history.
const MAX_LIMIT: u32 = 100;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: i64,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: i64,
    pub sender_id: i64,
    pub sender: String,
    pub receiver_id: i64,
    pub receiver: String,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: i64,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessageResponse>,
    pub has_more: bool,
}

// --- Queries ---

fn nickname_of(conn: &Connection, user_id: i64) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT nickname FROM users WHERE id = ?1",
        [user_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn insert_message(conn: &Connection, message: &MessageRow) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            message.sender_id,
            message.receiver_id,
            message.content,
            message.created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Conversation between `a` and `b` in either direction, newest first.
pub fn conversation(
    conn: &Connection,
    a: i64,
    b: i64,
    limit: u32,
    offset: u32,
) -> Result<(Vec<MessageResponse>, bool), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.sender_id, s.nickname, m.receiver_id, r.nickname, m.content, m.created_at
         FROM messages m
         JOIN users s ON s.id = m.sender_id
         JOIN users r ON r.id = m.receiver_id
         WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
            OR (m.sender_id = ?2 AND m.receiver_id = ?1)
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?3 OFFSET ?4",
    )?;
    let messages: Vec<MessageResponse> = stmt
        .query_map(
            rusqlite::params![a, b, i64::from(limit) + 1, i64::from(offset)],
            |row| {
                Ok(MessageResponse {
                    id: row.get(0)?,
                    sender_id: row.get(1)?,
                    sender: row.get(2)?,
                    receiver_id: row.get(3)?,
                    receiver: row.get(4)?,
                    content: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            },
        )?
        .collect::<Result<_, _>>()?;

    let has_more = messages.len() > limit as usize;
    let messages = messages.into_iter().take(limit as usize).collect();
    Ok((messages, has_more))
}

// --- Handlers ---

/// POST /api/messages
/// Persist a private message, then broadcast it as a `chat_message` envelope.
pub async fn send_message(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::bad_request("Message cannot be empty"));
    }
    if content.chars().count() > MAX_CHAT_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Message exceeds {} characters",
            MAX_CHAT_LENGTH
        )));
    }

    let db = state.db.clone();
    let sender = identity.clone();
    let receiver_id = req.receiver_id;

    let response = tokio::task::spawn_blocking(move || -> Result<MessageResponse, ApiError> {
        let conn = lock_db(&db)?;
        let receiver = nickname_of(&conn, receiver_id)?
            .ok_or_else(|| ApiError::not_found(format!("user {} does not exist", receiver_id)))?;

        let stamped = ChatMessage::new(&sender.nickname, &receiver_id.to_string(), &content)
            .ok_or_else(|| ApiError::bad_request("Message cannot be empty"))?;

        let row = MessageRow {
            id: 0,
            sender_id: sender.user_id,
            receiver_id,
            content: stamped.content,
            created_at: stamped.timestamp,
        };
        let id = insert_message(&conn, &row)?;

        Ok(MessageResponse {
            id,
            sender_id: row.sender_id,
            sender: sender.nickname,
            receiver_id,
            receiver,
            content: row.content,
            timestamp: row.created_at,
        })
    })
    .await??;

    // Live clients address users by id
    state.hub.broadcast_envelope(&Envelope::ChatMessage(ChatMessage {
        sender: response.sender.clone(),
        receiver: response.receiver_id.to_string(),
        content: response.content.clone(),
        timestamp: response.timestamp.clone(),
    }));

    tracing::info!(
        message_id = response.id,
        sender_id = response.sender_id,
        receiver_id = response.receiver_id,
        "Message sent"
    );

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/messages?user_id=&limit=&offset=
pub async fn history(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let db = state.db.clone();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let (messages, has_more) = tokio::task::spawn_blocking(move || {
        let conn = lock_db(&db)?;
        Ok::<_, ApiError>(conversation(
            &conn,
            identity.user_id,
            query.user_id,
            limit,
            offset,
        )?)
    })
    .await??;

    Ok(Json(HistoryResponse { messages, has_more }))
}
