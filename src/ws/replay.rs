//! Offline replay: at connect time, stream the messages the user missed
//! while disconnected, in ascending creation order.

use std::sync::Arc;

use crate::chat::store;
use crate::db::models::MessageType;
use crate::session::Connection;
use crate::state::AppState;
use crate::ws::frame::{Frame, FrameType};

/// Runs once, immediately after the connection is installed in the registry.
/// A missing last-disconnect time means a first-ever connection: nothing to
/// replay. Fetch failures are logged and never abort the connection.
pub async fn send_offline_messages(state: &AppState, conn: &Arc<Connection>) {
    let since = match store::last_disconnect_time(&state.db, conn.user_id).await {
        Ok(Some(ts)) => ts,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(user_id = conn.user_id, error = %e, "offline replay lookup failed");
            return;
        }
    };

    let messages = match store::offline_messages_since(&state.db, conn.user_id, since).await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(user_id = conn.user_id, error = %e, "offline replay fetch failed");
            return;
        }
    };

    let count = messages.len();
    for message in messages {
        let frame_type = match message.message_type {
            MessageType::Private => FrameType::PrivateMessage,
            _ => FrameType::GroupMessage,
        };
        let frame = Frame {
            message_id: Some(message.id),
            sender_id: Some(message.sender_id),
            sender_username: Some(message.sender_username),
            sender_nickname: Some(message.sender_nickname),
            receiver_id: message.receiver_id,
            group_id: message.group_id,
            group_name: message.group_name,
            content: Some(message.content),
            timestamp: Some(message.created_at),
            ..Frame::typed(frame_type)
        };
        conn.send_frame(&frame);
    }

    if count > 0 {
        tracing::info!(user_id = conn.user_id, count, "replayed offline messages");
    }
}
