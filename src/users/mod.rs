//! User lookup endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub nickname: String,
    pub online: bool,
}

impl UserResponse {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(UserResponse {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            nickname: row.get(3)?,
            online: row.get(4)?,
        })
    }
}

const USER_COLUMNS: &str = "id, username, email, nickname, online";

/// GET /api/users/me
pub async fn me(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<UserResponse>, StatusCode> {
    fetch_user(&state, claims.sub)
        .await?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/users/{id}
pub async fn get_user(
    State(state): State<AppState>,
    _claims: Claims,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, StatusCode> {
    fetch_user(&state, id).await?.map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/users/username/{username}
pub async fn get_user_by_username(
    State(state): State<AppState>,
    _claims: Claims,
    Path(username): Path<String>,
) -> Result<Json<UserResponse>, StatusCode> {
    let db = state.db.clone();
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            params![username],
            |row| {
                let mut user = UserResponse::from_row(row)?;
                user.online = sessions.contains(user.id);
                Ok(user)
            },
        )
        .optional()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??
    .map(Json)
    .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/users/online
///
/// The session registry is the live source of truth, not the `online`
/// column, so a row is only reported online while a socket is attached.
pub async fn online_users(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<Vec<UserResponse>>, StatusCode> {
    let ids: Vec<i64> = state.sessions.snapshot().iter().map(|c| c.user_id).collect();
    if ids.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let db = state.db.clone();
    let users = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id IN ({placeholders}) ORDER BY username"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                let mut user = UserResponse::from_row(row)?;
                user.online = true;
                Ok(user)
            })
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
}

/// GET /api/users/search?keyword=
pub async fn search_users(
    State(state): State<AppState>,
    _claims: Claims,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserResponse>>, StatusCode> {
    let keyword = query.keyword.trim().to_string();
    if keyword.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let db = state.db.clone();
    let sessions = state.sessions.clone();
    let users = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let pattern = format!("%{keyword}%");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE username LIKE ?1 OR nickname LIKE ?1
                 ORDER BY username LIMIT 50"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![pattern], UserResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut users: Vec<UserResponse> = rows
            .collect::<rusqlite::Result<_>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        for user in &mut users {
            user.online = sessions.contains(user.id);
        }
        Ok::<Vec<UserResponse>, StatusCode>(users)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(users))
}

async fn fetch_user(state: &AppState, id: i64) -> Result<Option<UserResponse>, StatusCode> {
    let db = state.db.clone();
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            |row| {
                let mut user = UserResponse::from_row(row)?;
                user.online = sessions.contains(user.id);
                Ok(user)
            },
        )
        .optional()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
}
