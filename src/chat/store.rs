//! Message store and user-directory operations consumed by the frame router,
//! offline replay, and the connection lifecycle.
//!
//! rusqlite is synchronous; every operation clones the pooled connection
//! handle and runs its queries inside tokio::task::spawn_blocking. No map or
//! registry lock is ever held across these calls.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::db::models::MessageType;
use crate::db::{now_millis, DbPool};

#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing or empty required frame field, or an otherwise invalid request.
    #[error("{0}")]
    Validation(String),
    /// Sender is not a member of the target group.
    #[error("you are not a member of this group")]
    NotMember,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("storage task failed")]
    Internal,
}

/// A freshly persisted message, enriched with the display fields the
/// response frame needs.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: i64,
    pub created_at: i64,
    pub sender_nickname: String,
    pub group_name: Option<String>,
}

/// A stored message fetched for offline replay.
#[derive(Debug, Clone)]
pub struct ReplayMessage {
    pub id: i64,
    pub content: String,
    pub message_type: MessageType,
    pub sender_id: i64,
    pub sender_username: String,
    pub sender_nickname: String,
    pub receiver_id: Option<i64>,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub created_at: i64,
}

/// Run a closure against the pooled connection on the blocking thread pool.
async fn with_conn<T, F>(db: &DbPool, f: F) -> Result<T, ChatError>
where
    F: FnOnce(&Connection) -> Result<T, ChatError> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ChatError::Internal)?;
        f(&conn)
    })
    .await
    .map_err(|_| ChatError::Internal)?
}

fn nickname_of(conn: &Connection, user_id: i64, who: &'static str) -> Result<String, ChatError> {
    conn.query_row(
        "SELECT nickname FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(ChatError::NotFound(who))
}

/// Persist a private message from `sender_id` to `receiver_id`.
/// Both users must exist and must differ.
pub async fn create_private_message(
    db: &DbPool,
    sender_id: i64,
    receiver_id: i64,
    content: String,
) -> Result<NewMessage, ChatError> {
    with_conn(db, move |conn| {
        if sender_id == receiver_id {
            return Err(ChatError::Validation(
                "cannot send a private message to yourself".into(),
            ));
        }
        let sender_nickname = nickname_of(conn, sender_id, "sender")?;
        nickname_of(conn, receiver_id, "receiver")?;

        let created_at = now_millis();
        conn.execute(
            "INSERT INTO messages (content, message_type, status, sender_id, receiver_id, created_at)
             VALUES (?1, 'PRIVATE', 'SENT', ?2, ?3, ?4)",
            params![content, sender_id, receiver_id, created_at],
        )?;

        Ok(NewMessage {
            id: conn.last_insert_rowid(),
            created_at,
            sender_nickname,
            group_name: None,
        })
    })
    .await
}

/// Persist a group message. The group must exist; membership is the caller's
/// concern (checked against the persistent group_members table before this).
pub async fn create_group_message(
    db: &DbPool,
    sender_id: i64,
    group_id: i64,
    content: String,
) -> Result<NewMessage, ChatError> {
    with_conn(db, move |conn| {
        let sender_nickname = nickname_of(conn, sender_id, "sender")?;
        let group_name: String = conn
            .query_row(
                "SELECT name FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ChatError::NotFound("group"))?;

        let created_at = now_millis();
        conn.execute(
            "INSERT INTO messages (content, message_type, status, sender_id, group_id, created_at)
             VALUES (?1, 'GROUP', 'SENT', ?2, ?3, ?4)",
            params![content, sender_id, group_id, created_at],
        )?;

        Ok(NewMessage {
            id: conn.last_insert_rowid(),
            created_at,
            sender_nickname,
            group_name: Some(group_name),
        })
    })
    .await
}

/// Persistent group membership check (group_members table, not the
/// in-memory presence index).
pub async fn is_group_member(db: &DbPool, group_id: i64, user_id: i64) -> Result<bool, ChatError> {
    with_conn(db, move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    })
    .await
}

/// All persistent member ids of a group, in join order. Empty for an
/// unknown group (every existing group has at least its owner).
pub async fn group_member_ids(db: &DbPool, group_id: i64) -> Result<Vec<i64>, ChatError> {
    with_conn(db, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY joined_at, user_id",
        )?;
        let ids = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    })
    .await
}

/// All group ids the user persistently belongs to. Used to seed the group
/// presence index at connect time.
pub async fn group_ids_for_user(db: &DbPool, user_id: i64) -> Result<Vec<i64>, ChatError> {
    with_conn(db, move |conn| {
        let mut stmt =
            conn.prepare("SELECT group_id FROM group_members WHERE user_id = ?1")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    })
    .await
}

/// Record the user's online/offline transition. Online stamps the last login
/// time; offline stamps the last logout time, which is what offline replay
/// keys on at the next connect.
pub async fn set_online_status(
    db: &DbPool,
    user_id: i64,
    online: bool,
    at: i64,
) -> Result<(), ChatError> {
    with_conn(db, move |conn| {
        if online {
            conn.execute(
                "UPDATE users SET online = 1, last_login_at = ?2 WHERE id = ?1",
                params![user_id, at],
            )?;
        } else {
            conn.execute(
                "UPDATE users SET online = 0, last_logout_at = ?2 WHERE id = ?1",
                params![user_id, at],
            )?;
        }
        Ok(())
    })
    .await
}

/// The user's last recorded disconnect time, or None for a first-ever
/// connection (offline replay is skipped in that case).
pub async fn last_disconnect_time(db: &DbPool, user_id: i64) -> Result<Option<i64>, ChatError> {
    with_conn(db, move |conn| {
        let ts: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_logout_at FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.flatten())
    })
    .await
}

/// Messages addressed to the user created strictly after `since`, ascending
/// by creation time: private messages to the user plus group messages in
/// the user's persistent groups.
pub async fn offline_messages_since(
    db: &DbPool,
    user_id: i64,
    since: i64,
) -> Result<Vec<ReplayMessage>, ChatError> {
    with_conn(db, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT m.id, m.content, m.message_type, m.sender_id, u.username, u.nickname,
                    m.receiver_id, m.group_id, g.name, m.created_at
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             LEFT JOIN chat_groups g ON g.id = m.group_id
             WHERE m.created_at > ?2
               AND ((m.message_type = 'PRIVATE' AND m.receiver_id = ?1)
                 OR (m.message_type = 'GROUP' AND m.sender_id != ?1 AND m.group_id IN
                     (SELECT group_id FROM group_members WHERE user_id = ?1)))
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let messages = stmt
            .query_map(params![user_id, since], |row| {
                let type_str: String = row.get(2)?;
                Ok(ReplayMessage {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    message_type: MessageType::from_str(&type_str)
                        .unwrap_or(MessageType::System),
                    sender_id: row.get(3)?,
                    sender_username: row.get(4)?,
                    sender_nickname: row.get(5)?,
                    receiver_id: row.get(6)?,
                    group_id: row.get(7)?,
                    group_name: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    })
    .await
}
