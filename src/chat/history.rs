//! Message history and read-state endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::db::now_millis;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    20
}

impl PageQuery {
    /// Clamped page size plus the row offset, widened so a hostile page
    /// number cannot overflow.
    fn limit_offset(&self) -> (i64, i64) {
        let size = i64::from(self.size.clamp(1, 100));
        (size, i64::from(self.page) * size)
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub sender_id: i64,
    pub sender_nickname: String,
    pub receiver_id: Option<i64>,
    pub group_id: Option<i64>,
    pub created_at: i64,
    pub read_at: Option<i64>,
}

impl MessageResponse {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(MessageResponse {
            id: row.get(0)?,
            content: row.get(1)?,
            message_type: row.get(2)?,
            status: row.get(3)?,
            sender_id: row.get(4)?,
            sender_nickname: row.get(5)?,
            receiver_id: row.get(6)?,
            group_id: row.get(7)?,
            created_at: row.get(8)?,
            read_at: row.get(9)?,
        })
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.content, m.message_type, m.status, m.sender_id,
    u.nickname, m.receiver_id, m.group_id, m.created_at, m.read_at";

/// GET /api/messages/private/{user_id}?page=&size=
/// Both directions of the conversation, newest page first, rows ascending.
pub async fn private_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(other_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let (limit, offset) = page.limit_offset();
    let db = state.db.clone();
    let me = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT * FROM messages
                     WHERE message_type = 'PRIVATE'
                       AND ((sender_id = ?1 AND receiver_id = ?2)
                         OR (sender_id = ?2 AND receiver_id = ?1))
                     ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4
                 ) m JOIN users u ON u.id = m.sender_id
                 ORDER BY m.created_at ASC, m.id ASC"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![me, other_id, limit, offset], MessageResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages))
}

/// GET /api/messages/group/{group_id}?page=&size=
/// Members only.
pub async fn group_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let (limit, offset) = page.limit_offset();
    let db = state.db.clone();
    let me = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let member: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, me],
                |row| row.get(0),
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        if member == 0 {
            return Err(StatusCode::FORBIDDEN);
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT * FROM messages WHERE group_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3
                 ) m JOIN users u ON u.id = m.sender_id
                 ORDER BY m.created_at ASC, m.id ASC"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![group_id, limit, offset], MessageResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages))
}

/// GET /api/messages/unread
/// Private messages addressed to the caller that are not yet read.
pub async fn unread_messages(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.receiver_id = ?1 AND m.status != 'READ'
                 ORDER BY m.created_at ASC, m.id ASC"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![me], MessageResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages))
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

/// PUT /api/messages/read/{sender_id}
/// Marks every unread private message from that sender as read.
pub async fn mark_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(sender_id): Path<i64>,
) -> Result<Json<MarkReadResponse>, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub;
    let updated = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        conn.execute(
            "UPDATE messages SET status = 'READ', read_at = ?3
             WHERE receiver_id = ?1 AND sender_id = ?2 AND status != 'READ'",
            params![me, sender_id, now_millis()],
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(MarkReadResponse { updated }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset_never_overflows() {
        let query = PageQuery {
            page: u32::MAX,
            size: u32::MAX,
        };
        let (limit, offset) = query.limit_offset();
        assert_eq!(limit, 100);
        assert_eq!(offset, i64::from(u32::MAX) * 100);
    }

    #[test]
    fn page_size_is_clamped() {
        let query = PageQuery { page: 2, size: 0 };
        assert_eq!(query.limit_offset(), (1, 2));

        let query = PageQuery { page: 0, size: 500 };
        assert_eq!(query.limit_offset(), (100, 0));
    }
}
