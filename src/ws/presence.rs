//! Presence broadcaster: USER_ONLINE / USER_OFFLINE fan-out.

use crate::state::AppState;
use crate::ws::frame::Frame;

/// Notify every other live connection of a user's online/offline transition.
///
/// Iterates a registry snapshot and enqueues one frame per target; each
/// connection's writer task does the socket I/O, so delivery failures are
/// isolated to the broken peer and a slow peer delays nobody. Not retried.
pub fn broadcast_user_status(state: &AppState, user_id: i64, username: &str, online: bool) {
    let frame = if online {
        Frame::user_online(user_id, username)
    } else {
        Frame::user_offline(user_id, username)
    };

    for conn in state.sessions.snapshot() {
        if conn.user_id == user_id || !conn.is_open() {
            continue;
        }
        conn.send_frame(&frame);
    }
}
