use axum::{extract::FromRequestParts, http::request::Parts};

use crate::auth::session::{self, Identity, SESSION_COOKIE};
use crate::error::ApiError;
use crate::state::AppState;

/// Session identity extracted from the `session_token` cookie.
/// Any handler taking an `Identity` argument is authenticated.
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session::token_from_headers(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("missing session cookie"))?
            .to_string();

        Ok(session::validate_token(&state.db, token).await?)
    }
}

/// Build the Set-Cookie value that installs a session.
pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let secure_flag = if secure { " Secure;" } else { "" };
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict;{} Max-Age={}",
        SESSION_COOKIE, token, secure_flag, max_age_secs
    )
}

/// Build the Set-Cookie value that removes the session cookie.
pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_flags() {
        let cookie = session_cookie("tok", 86400, true);
        assert_eq!(
            cookie,
            "session_token=tok; Path=/; HttpOnly; SameSite=Strict; Secure; Max-Age=86400"
        );

        let insecure = session_cookie("tok", 60, false);
        assert!(!insecure.contains("Secure"));
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        assert!(clear_session_cookie(false).starts_with("session_token=;"));
        assert!(clear_session_cookie(false).ends_with("Max-Age=0"));
    }
}
