//! Group management endpoints.
//!
//! These endpoints own persistent membership (the group_members table).
//! The live `GroupPresenceIndex` is normally driven by the WebSocket
//! JOIN_GROUP / LEAVE_GROUP frames and connect-time seeding; join and
//! leave here additionally sync the index for a user who is currently
//! connected, so a REST membership change takes effect without a
//! reconnect.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::chat::store;
use crate::db::now_millis;
use crate::state::AppState;
use crate::users::UserResponse;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    pub max_members: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub max_members: i64,
    pub member_count: i64,
    pub created_at: i64,
}

impl GroupResponse {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(GroupResponse {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            owner_id: row.get(3)?,
            max_members: row.get(4)?,
            member_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.owner_id, g.max_members,
    (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id), g.created_at";

type ApiError = (StatusCode, String);

fn internal() -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

/// POST /api/groups
/// The creator becomes the owner and its first member.
pub async fn create_group(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupResponse>), ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.len() > 64 {
        return Err((StatusCode::BAD_REQUEST, "group name must be 1-64 characters".to_string()));
    }
    let max_members = body.max_members.unwrap_or(200);
    if !(2..=1000).contains(&max_members) {
        return Err((StatusCode::BAD_REQUEST, "max_members must be 2-1000".to_string()));
    }

    let db = state.db.clone();
    let owner_id = claims.sub;
    let group = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let taken: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chat_groups WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|_| internal())?;
        if taken > 0 {
            return Err((StatusCode::BAD_REQUEST, "group name already exists".to_string()));
        }

        let created_at = now_millis();
        conn.execute(
            "INSERT INTO chat_groups (name, description, owner_id, max_members, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, body.description, owner_id, max_members, created_at],
        )
        .map_err(|_| internal())?;
        let group_id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO group_members (group_id, user_id, role, joined_at)
             VALUES (?1, ?2, 'OWNER', ?3)",
            params![group_id, owner_id, created_at],
        )
        .map_err(|_| internal())?;

        Ok(GroupResponse {
            id: group_id,
            name,
            description: body.description,
            owner_id,
            max_members,
            member_count: 1,
            created_at,
        })
    })
    .await
    .map_err(|_| internal())??;

    tracing::info!(group_id = group.id, owner_id, name = %group.name, "group created");

    Ok((StatusCode::CREATED, Json(group)))
}

/// GET /api/groups/{id}
pub async fn get_group(
    State(state): State<AppState>,
    _claims: Claims,
    Path(group_id): Path<i64>,
) -> Result<Json<GroupResponse>, StatusCode> {
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        conn.query_row(
            &format!("SELECT {GROUP_COLUMNS} FROM chat_groups g WHERE g.id = ?1"),
            params![group_id],
            GroupResponse::from_row,
        )
        .optional()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??
    .map(Json)
    .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
pub struct GroupSearchQuery {
    pub keyword: String,
}

/// GET /api/groups/search?keyword=
pub async fn search_groups(
    State(state): State<AppState>,
    _claims: Claims,
    Query(query): Query<GroupSearchQuery>,
) -> Result<Json<Vec<GroupResponse>>, StatusCode> {
    let keyword = query.keyword.trim().to_string();
    if keyword.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let db = state.db.clone();
    let groups = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let pattern = format!("%{keyword}%");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM chat_groups g
                 WHERE g.name LIKE ?1 OR g.description LIKE ?1
                 ORDER BY g.name LIMIT 50"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![pattern], GroupResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(groups))
}

/// GET /api/groups/my
pub async fn my_groups(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<GroupResponse>>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let groups = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM chat_groups g
                 JOIN group_members m ON m.group_id = g.id
                 WHERE m.user_id = ?1 ORDER BY g.name"
            ))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let rows = stmt
            .query_map(params![user_id], GroupResponse::from_row)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(groups))
}

/// GET /api/groups/{id}/members
/// An empty member list means the group does not exist: a live group always
/// contains at least its owner.
pub async fn group_members(
    State(state): State<AppState>,
    _claims: Claims,
    Path(group_id): Path<i64>,
) -> Result<Json<Vec<UserResponse>>, StatusCode> {
    let ids = store::group_member_ids(&state.db, group_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if ids.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }

    let db = state.db.clone();
    let sessions = state.sessions.clone();
    let members = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let mut members = Vec::with_capacity(ids.len());
        let mut stmt = conn
            .prepare("SELECT id, username, email, nickname FROM users WHERE id = ?1")
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        for id in ids {
            let user = stmt
                .query_row(params![id], |row| {
                    Ok(UserResponse {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        nickname: row.get(3)?,
                        online: sessions.contains(id),
                    })
                })
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            members.push(user);
        }
        Ok::<Vec<UserResponse>, StatusCode>(members)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(members))
}

/// POST /api/groups/{id}/join
pub async fn join_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let group: Option<(i64, i64)> = conn
            .query_row(
                "SELECT max_members,
                        (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
                 FROM chat_groups g WHERE g.id = ?1",
                params![group_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|_| internal())?;
        let Some((max_members, member_count)) = group else {
            return Err((StatusCode::NOT_FOUND, "group not found".to_string()));
        };

        let already: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
                |row| row.get(0),
            )
            .map_err(|_| internal())?;
        if already > 0 {
            return Err((StatusCode::BAD_REQUEST, "already a member".to_string()));
        }
        if member_count >= max_members {
            return Err((StatusCode::BAD_REQUEST, "group is full".to_string()));
        }

        conn.execute(
            "INSERT INTO group_members (group_id, user_id, role, joined_at)
             VALUES (?1, ?2, 'MEMBER', ?3)",
            params![group_id, user_id, now_millis()],
        )
        .map_err(|_| internal())?;
        Ok(())
    })
    .await
    .map_err(|_| internal())??;

    if state.sessions.contains(user_id) {
        state.groups.add_member(group_id, user_id);
    }

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/groups/{id}/leave
/// Owners cannot leave their own group; they must delete it instead.
pub async fn leave_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let owner_id: Option<i64> = conn
            .query_row(
                "SELECT owner_id FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| internal())?;
        let Some(owner_id) = owner_id else {
            return Err((StatusCode::NOT_FOUND, "group not found".to_string()));
        };
        if owner_id == user_id {
            return Err((StatusCode::BAD_REQUEST, "owner cannot leave the group".to_string()));
        }

        let removed = conn
            .execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )
            .map_err(|_| internal())?;
        if removed == 0 {
            return Err((StatusCode::BAD_REQUEST, "not a member".to_string()));
        }
        Ok(())
    })
    .await
    .map_err(|_| internal())??;

    // Drop live presence too, if the user has a socket attached.
    state.groups.remove_member(group_id, user_id);

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/groups/{id}/members/{user_id}
/// Owner only. The owner cannot kick themselves; they delete the group
/// instead.
pub async fn kick_member(
    State(state): State<AppState>,
    claims: Claims,
    Path((group_id, target_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.clone();
    let caller_id = claims.sub;
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let owner_id: Option<i64> = conn
            .query_row(
                "SELECT owner_id FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| internal())?;
        let Some(owner_id) = owner_id else {
            return Err((StatusCode::NOT_FOUND, "group not found".to_string()));
        };
        if owner_id != caller_id {
            return Err((StatusCode::FORBIDDEN, "only the owner may remove members".to_string()));
        }
        if target_id == owner_id {
            return Err((StatusCode::BAD_REQUEST, "owner cannot be removed from the group".to_string()));
        }

        let removed = conn
            .execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, target_id],
            )
            .map_err(|_| internal())?;
        if removed == 0 {
            return Err((StatusCode::BAD_REQUEST, "not a member".to_string()));
        }
        Ok(())
    })
    .await
    .map_err(|_| internal())??;

    // The kicked user must stop receiving group fan-out immediately.
    state.groups.remove_member(group_id, target_id);

    tracing::info!(group_id, target_id, "member removed from group");

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/groups/{id}
/// Owner only. Memberships and group messages cascade.
pub async fn delete_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| internal())?;

        let owner_id: Option<i64> = conn
            .query_row(
                "SELECT owner_id FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| internal())?;
        let Some(owner_id) = owner_id else {
            return Err((StatusCode::NOT_FOUND, "group not found".to_string()));
        };
        if owner_id != user_id {
            return Err((StatusCode::FORBIDDEN, "only the owner may delete the group".to_string()));
        }

        conn.execute("DELETE FROM chat_groups WHERE id = ?1", params![group_id])
            .map_err(|_| internal())?;
        Ok(())
    })
    .await
    .map_err(|_| internal())??;

    tracing::info!(group_id, "group deleted");

    Ok(StatusCode::NO_CONTENT)
}
