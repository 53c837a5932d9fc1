//! Registration and login endpoints.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::State, http::StatusCode, Json};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::jwt;
use crate::db::now_millis;
use crate::state::AppState;
use crate::users::UserResponse;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct JwtResponse {
    pub token: String,
    pub expires_in: i64,
    pub user: UserResponse,
}

type ApiError = (StatusCode, String);

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn internal() -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

/// POST /api/auth/register
/// Creates a user and returns a token, so registration doubles as login.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<JwtResponse>, ApiError> {
    let username = body.username.trim().to_string();
    if username.len() < 3 || username.len() > 32 {
        return Err(bad_request("username must be 3-32 characters"));
    }
    if body.password.len() < 6 {
        return Err(bad_request("password must be at least 6 characters"));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(body.password.as_bytes(), &salt)
        .map_err(|_| internal())?
        .to_string();

    let nickname = body
        .nickname
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| username.clone());
    let email = body.email.filter(|e| !e.trim().is_empty());

    let db = state.db.clone();
    let uname = username.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let taken: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1",
                params![uname],
                |row| row.get(0),
            )
            .map_err(|_| internal())?;
        if taken > 0 {
            return Err(bad_request("username already exists"));
        }

        if let Some(email) = &email {
            let taken: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM users WHERE email = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .map_err(|_| internal())?;
            if taken > 0 {
                return Err(bad_request("email already registered"));
            }
        }

        let created_at = now_millis();
        conn.execute(
            "INSERT INTO users (username, password_hash, email, nickname, online, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![uname, password_hash, email, nickname, created_at],
        )
        .map_err(|_| internal())?;

        Ok(UserResponse {
            id: conn.last_insert_rowid(),
            username: uname,
            email,
            nickname,
            online: false,
        })
    })
    .await
    .map_err(|_| internal())??;

    tracing::info!(user_id = user.id, username = %user.username, "user registered");

    let token = jwt::issue_token(&state.jwt_secret, user.id, &user.username)
        .map_err(|_| internal())?;

    Ok(Json(JwtResponse {
        token,
        expires_in: jwt::TOKEN_TTL_SECS,
        user,
    }))
}

/// POST /api/auth/login
/// Verifies the password and returns a fresh token. Stamps last_login_at.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<JwtResponse>, ApiError> {
    let db = state.db.clone();
    let username = body.username.trim().to_string();

    let row = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;
        conn.query_row(
            "SELECT id, username, password_hash, email, nickname, online FROM users WHERE username = ?1",
            params![username],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, bool>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|_| internal())
    })
    .await
    .map_err(|_| internal())??;

    let Some((id, username, password_hash, email, nickname, online)) = row else {
        return Err((StatusCode::UNAUTHORIZED, "invalid credentials".to_string()));
    };

    let parsed = PasswordHash::new(&password_hash).map_err(|_| internal())?;
    if Argon2::default()
        .verify_password(body.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err((StatusCode::UNAUTHORIZED, "invalid credentials".to_string()));
    }

    // Stamp last login time
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        if let Ok(conn) = db.lock() {
            let _ = conn.execute(
                "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
                params![id, now_millis()],
            );
        }
    })
    .await
    .map_err(|_| internal())?;

    let token = jwt::issue_token(&state.jwt_secret, id, &username).map_err(|_| internal())?;

    tracing::info!(user_id = id, username = %username, "user logged in");

    Ok(Json(JwtResponse {
        token,
        expires_in: jwt::TOKEN_TTL_SECS,
        user: UserResponse {
            id,
            username,
            email,
            nickname,
            online,
        },
    }))
}
