//! Per-connection frame router.
//!
//! Classifies each inbound text frame by type and dispatches it. Every error
//! raised while handling a frame is converted to a single ERROR frame sent
//! back to the originating connection; it never terminates the connection.

use std::sync::Arc;

use crate::chat::store::{self, ChatError};
use crate::session::Connection;
use crate::state::AppState;
use crate::ws::frame::{Frame, FrameType};

/// Handle one inbound text frame. Frames from the same connection are
/// processed strictly sequentially by the reader loop in the actor.
pub async fn handle_frame(text: &str, conn: &Arc<Connection>, state: &AppState) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(user_id = conn.user_id, error = %e, "undecodable frame");
            conn.send_frame(&Frame::error("invalid or unrecognized message type"));
            return;
        }
    };

    let result = match frame.frame_type {
        FrameType::PrivateMessage => handle_private_message(&frame, conn, state).await,
        FrameType::GroupMessage => handle_group_message(&frame, conn, state).await,
        FrameType::JoinGroup => handle_join_group(&frame, conn, state),
        FrameType::LeaveGroup => handle_leave_group(&frame, conn, state),
        FrameType::Ping => {
            conn.send_frame(&Frame::pong());
            Ok(())
        }
        // Server-emitted types are not valid inbound.
        FrameType::PrivateMessageAck
        | FrameType::GroupMessageAck
        | FrameType::GroupNotification
        | FrameType::UserOnline
        | FrameType::UserOffline
        | FrameType::System
        | FrameType::Error
        | FrameType::Pong => Err(ChatError::Validation(format!(
            "unexpected message type {:?}",
            frame.frame_type
        ))),
    };

    if let Err(e) = result {
        tracing::warn!(user_id = conn.user_id, error = %e, "frame handling failed");
        conn.send_frame(&Frame::error(e.to_string()));
    }
}

fn required_content(frame: &Frame, missing: &str) -> Result<String, ChatError> {
    frame
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ChatError::Validation(missing.to_string()))
}

/// PRIVATE_MESSAGE: persist, deliver to the receiver if reachable (best
/// effort, never queued), acknowledge to the sender.
async fn handle_private_message(
    frame: &Frame,
    conn: &Arc<Connection>,
    state: &AppState,
) -> Result<(), ChatError> {
    let receiver_id = frame.receiver_id.ok_or_else(|| {
        ChatError::Validation("receiverId and content are required".into())
    })?;
    let content = required_content(frame, "receiverId and content are required")?;

    if receiver_id == conn.user_id {
        return Err(ChatError::Validation(
            "cannot send a private message to yourself".into(),
        ));
    }

    let saved =
        store::create_private_message(&state.db, conn.user_id, receiver_id, content.clone())
            .await?;

    let response = Frame {
        message_id: Some(saved.id),
        sender_id: Some(conn.user_id),
        sender_username: Some(conn.username.clone()),
        sender_nickname: Some(saved.sender_nickname),
        receiver_id: Some(receiver_id),
        content: Some(content),
        timestamp: Some(saved.created_at),
        ..Frame::typed(FrameType::PrivateMessage)
    };

    // Deliver only if the receiver holds a live, open connection right now.
    if let Some(receiver) = state.sessions.get(receiver_id) {
        if receiver.is_open() {
            receiver.send_frame(&response);
        }
    }

    let ack = Frame {
        message_id: Some(saved.id),
        receiver_id: Some(receiver_id),
        timestamp: Some(saved.created_at),
        ..Frame::typed(FrameType::PrivateMessageAck)
    };
    conn.send_frame(&ack);

    tracing::debug!(
        sender_id = conn.user_id,
        receiver_id,
        message_id = saved.id,
        "private message routed"
    );
    Ok(())
}

/// GROUP_MESSAGE: membership-checked against persistent membership, then
/// persisted and fanned out to the group's online members except the sender.
async fn handle_group_message(
    frame: &Frame,
    conn: &Arc<Connection>,
    state: &AppState,
) -> Result<(), ChatError> {
    let group_id = frame
        .group_id
        .ok_or_else(|| ChatError::Validation("groupId and content are required".into()))?;
    let content = required_content(frame, "groupId and content are required")?;

    if !store::is_group_member(&state.db, group_id, conn.user_id).await? {
        return Err(ChatError::NotMember);
    }

    let saved =
        store::create_group_message(&state.db, conn.user_id, group_id, content.clone()).await?;

    let response = Frame {
        message_id: Some(saved.id),
        sender_id: Some(conn.user_id),
        sender_username: Some(conn.username.clone()),
        sender_nickname: Some(saved.sender_nickname),
        group_id: Some(group_id),
        group_name: saved.group_name,
        content: Some(content),
        timestamp: Some(saved.created_at),
        ..Frame::typed(FrameType::GroupMessage)
    };

    deliver_to_group(state, group_id, conn.user_id, &response);

    let ack = Frame {
        message_id: Some(saved.id),
        group_id: Some(group_id),
        timestamp: Some(saved.created_at),
        ..Frame::typed(FrameType::GroupMessageAck)
    };
    conn.send_frame(&ack);

    tracing::debug!(
        sender_id = conn.user_id,
        group_id,
        message_id = saved.id,
        "group message routed"
    );
    Ok(())
}

/// JOIN_GROUP: in-memory presence only; persistent membership is the REST
/// surface's concern.
fn handle_join_group(
    frame: &Frame,
    conn: &Arc<Connection>,
    state: &AppState,
) -> Result<(), ChatError> {
    let group_id = frame
        .group_id
        .ok_or_else(|| ChatError::Validation("groupId is required".into()))?;

    state.groups.add_member(group_id, conn.user_id);

    let notification = Frame {
        sender_id: Some(conn.user_id),
        sender_username: Some(conn.username.clone()),
        group_id: Some(group_id),
        content: Some(format!("{} joined the group", conn.username)),
        timestamp: Some(crate::db::now_millis()),
        ..Frame::typed(FrameType::GroupNotification)
    };
    deliver_to_group(state, group_id, conn.user_id, &notification);
    Ok(())
}

/// LEAVE_GROUP: notify the remaining online members, then drop the user
/// from the presence index.
fn handle_leave_group(
    frame: &Frame,
    conn: &Arc<Connection>,
    state: &AppState,
) -> Result<(), ChatError> {
    let group_id = frame
        .group_id
        .ok_or_else(|| ChatError::Validation("groupId is required".into()))?;

    let notification = Frame {
        sender_id: Some(conn.user_id),
        sender_username: Some(conn.username.clone()),
        group_id: Some(group_id),
        content: Some(format!("{} left the group", conn.username)),
        timestamp: Some(crate::db::now_millis()),
        ..Frame::typed(FrameType::GroupNotification)
    };
    deliver_to_group(state, group_id, conn.user_id, &notification);

    state.groups.remove_member(group_id, conn.user_id);
    Ok(())
}

/// Enqueue a frame for every online member of the group except `sender_id`.
/// Sends only enqueue on each member's writer channel, so one slow or broken
/// peer cannot delay delivery to the rest.
fn deliver_to_group(state: &AppState, group_id: i64, sender_id: i64, frame: &Frame) {
    for member_id in state.groups.online_members(group_id, &state.sessions) {
        if member_id == sender_id {
            continue;
        }
        if let Some(member) = state.sessions.get(member_id) {
            if member.is_open() {
                member.send_frame(frame);
            }
        }
    }
}
