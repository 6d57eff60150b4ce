//! Account registration and cookie session endpoints.

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse},
    Json,
};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::auth::middleware::{clear_session_cookie, session_cookie};
use crate::auth::password::{self, MIN_PASSWORD_LENGTH};
use crate::auth::session::{self, Identity};
use crate::db::models::User;
use crate::error::{lock_db, ApiError};
use crate::state::AppState;

const MAX_PASSWORD_LENGTH: usize = 72;
const NICKNAME_MIN: usize = 3;
const NICKNAME_MAX: usize = 20;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub gender: String,
    pub age: i64,
    pub nickname: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Email or nickname
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserResponse {
    pub id: i64,
    pub nickname: String,
}

impl From<Identity> for UserResponse {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.user_id,
            nickname: identity.nickname,
        }
    }
}

/// Validated, normalized registration fields.
struct NewUser {
    first_name: String,
    last_name: String,
    email: String,
    gender: String,
    age: i64,
    nickname: String,
}

fn validate_registration(req: &RegisterRequest) -> Result<NewUser, ApiError> {
    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    let gender = req.gender.trim();
    if first_name.is_empty() || last_name.is_empty() || gender.is_empty() {
        return Err(ApiError::bad_request(
            "first_name, last_name and gender are required",
        ));
    }

    let email = req.email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => return Err(ApiError::bad_request("Invalid email format")),
    }

    let nickname = req.nickname.trim();
    let nickname_len = nickname.chars().count();
    if !(NICKNAME_MIN..=NICKNAME_MAX).contains(&nickname_len)
        || !nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ApiError::bad_request(format!(
            "Nickname must be {}-{} characters (letters, digits, underscores)",
            NICKNAME_MIN, NICKNAME_MAX
        )));
    }
    if !(1..=150).contains(&req.age) {
        return Err(ApiError::bad_request("Age must be between 1 and 150"));
    }

    if req.password.len() < MIN_PASSWORD_LENGTH || req.password.len() > MAX_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be {}-{} characters",
            MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH
        )));
    }

    Ok(NewUser {
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email,
        gender: gender.to_string(),
        age: req.age,
        nickname: nickname.to_string(),
    })
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let new_user = validate_registration(&req)?;
    let db = state.db.clone();
    let password = req.password;

    let response = tokio::task::spawn_blocking(move || -> Result<UserResponse, ApiError> {
        // Hash outside the lock
        let password_hash = password::hash_password(&password)
            .map_err(|e| ApiError::internal(format!("password hashing failed: {}", e)))?;

        let conn = lock_db(&db)?;

        let email_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
            [&new_user.email],
            |row| row.get(0),
        )?;
        if email_taken {
            return Err(ApiError::conflict("Email already in use"));
        }

        let nickname_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE nickname = ?1 COLLATE NOCASE)",
            [&new_user.nickname],
            |row| row.get(0),
        )?;
        if nickname_taken {
            return Err(ApiError::conflict("Nickname already taken"));
        }

        conn.execute(
            "INSERT INTO users (first_name, last_name, email, gender, age, nickname, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                new_user.first_name,
                new_user.last_name,
                new_user.email,
                new_user.gender,
                new_user.age,
                new_user.nickname,
                password_hash,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(UserResponse {
            id: conn.last_insert_rowid(),
            nickname: new_user.nickname,
        })
    })
    .await??;

    tracing::info!(user_id = response.id, nickname = %response.nickname, "User registered");

    Ok((StatusCode::CREATED, Json(response)))
}

/// Look up a user by email (case-insensitive) or nickname.
fn find_user(conn: &rusqlite::Connection, identifier: &str) -> Result<Option<User>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, first_name, last_name, email, gender, age, nickname, password_hash, created_at
         FROM users WHERE email = lower(?1) OR nickname = ?1 COLLATE NOCASE",
        [identifier],
        |row| {
            Ok(User {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                email: row.get(3)?,
                gender: row.get(4)?,
                age: row.get(5)?,
                nickname: row.get(6)?,
                password_hash: row.get(7)?,
                created_at: row.get(8)?,
            })
        },
    )
    .optional()
}

/// POST /api/auth/login
/// Verifies the password and installs a fresh session cookie.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identifier = req.identifier.trim().to_string();
    if identifier.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("identifier and password are required"));
    }

    let db = state.db.clone();
    let ttl = chrono::Duration::hours(state.session_ttl_hours);
    let password = req.password;

    let (user, token) = tokio::task::spawn_blocking(move || -> Result<(User, String), ApiError> {
        let user = {
            let conn = lock_db(&db)?;
            find_user(&conn, &identifier)?
        };

        // Same message for unknown user and wrong password
        let user = match user {
            Some(user) if password::verify_password(&password, &user.password_hash) => user,
            _ => return Err(ApiError::unauthorized("Invalid credentials")),
        };

        let conn = lock_db(&db)?;
        let token = session::create_session(&conn, user.id, ttl)?;
        Ok((user, token))
    })
    .await??;

    tracing::info!(user_id = user.id, nickname = %user.nickname, "User logged in");

    let cookie = session_cookie(&token, ttl.num_seconds(), state.secure_cookies);
    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(UserResponse {
            id: user.id,
            nickname: user.nickname,
        }),
    ))
}

/// POST /api/auth/logout
/// Always clears the cookie; deletes the server-side session when one exists.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(token) = session::token_from_headers(&headers) {
        let token = token.to_string();
        let db = state.db.clone();
        let revoked = tokio::task::spawn_blocking(move || -> Result<bool, ApiError> {
            let conn = lock_db(&db)?;
            Ok(session::revoke_session(&conn, &token)?)
        })
        .await??;
        if revoked {
            tracing::info!("Session revoked");
        }
    }

    Ok((
        StatusCode::NO_CONTENT,
        AppendHeaders([(SET_COOKIE, clear_session_cookie(state.secure_cookies))]),
    ))
}

/// GET /api/auth/me
pub async fn me(identity: Identity) -> Json<UserResponse> {
    Json(identity.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RegisterRequest {
        RegisterRequest {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: " Ada@Example.com ".into(),
            gender: "female".into(),
            age: 36,
            nickname: "ada_l".into(),
            password: "analytical1".into(),
        }
    }

    #[test]
    fn test_registration_normalizes_fields() {
        let user = validate_registration(&request()).unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.nickname, "ada_l");
    }

    #[test]
    fn test_registration_rejects_bad_input() {
        let mut req = request();
        req.age = 0;
        assert!(matches!(validate_registration(&req), Err(ApiError::BadRequest(_))));

        let mut req = request();
        req.nickname = "a b".into();
        assert!(validate_registration(&req).is_err());

        let mut req = request();
        req.email = "not-an-email".into();
        assert!(validate_registration(&req).is_err());

        let mut req = request();
        req.password = "short".into();
        assert!(validate_registration(&req).is_err());

        let mut req = request();
        req.first_name = "   ".into();
        assert!(validate_registration(&req).is_err());
    }
}
