//! Wire-level frame exchanged over a chat WebSocket connection.
//!
//! Flat JSON object with camelCase keys and a `type` tag from a closed
//! enumeration. Omitted optional fields are absent in the serialized form,
//! never defaulted to sentinel values. A frame whose `type` is outside the
//! enumeration fails deserialization; the router answers with an ERROR frame
//! and leaves the connection open.

use serde::{Deserialize, Serialize};

use crate::db::now_millis;

/// Closed set of frame types. Dispatch matches exhaustively on this enum,
/// so adding a variant forces every match site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    PrivateMessage,
    PrivateMessageAck,
    GroupMessage,
    GroupMessageAck,
    JoinGroup,
    LeaveGroup,
    GroupNotification,
    UserOnline,
    UserOffline,
    System,
    Error,
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    /// Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Frame {
    /// Frame of the given type with every optional field absent. Intended
    /// for struct-update construction of response frames.
    pub fn typed(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            sender_id: None,
            sender_username: None,
            sender_nickname: None,
            receiver_id: None,
            group_id: None,
            group_name: None,
            content: None,
            message_id: None,
            timestamp: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Some(message.into()),
            timestamp: Some(now_millis()),
            ..Self::typed(FrameType::Error)
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            content: Some(message.into()),
            timestamp: Some(now_millis()),
            ..Self::typed(FrameType::System)
        }
    }

    pub fn pong() -> Self {
        Self {
            timestamp: Some(now_millis()),
            ..Self::typed(FrameType::Pong)
        }
    }

    pub fn user_online(user_id: i64, username: &str) -> Self {
        Self {
            sender_id: Some(user_id),
            sender_username: Some(username.to_string()),
            timestamp: Some(now_millis()),
            ..Self::typed(FrameType::UserOnline)
        }
    }

    pub fn user_offline(user_id: i64, username: &str) -> Self {
        Self {
            sender_id: Some(user_id),
            sender_username: Some(username.to_string()),
            timestamp: Some(now_millis()),
            ..Self::typed(FrameType::UserOffline)
        }
    }
}
