use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::chat::store;
use crate::db::now_millis;
use crate::session::Connection;
use crate::state::AppState;
use crate::ws::{presence, protocol, replay};

/// Ping interval: server sends a WebSocket ping every 30 seconds so that
/// abruptly dropped transports actually report closed for the reaper.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if no pong arrives within 10 seconds after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a connection superseded by a newer handshake for the
/// same user id.
pub const CLOSE_REPLACED: u16 = 4000;

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes inbound frames strictly in arrival order
///
/// Cloning the channel sender (via the registry's Connection handle) is how
/// any part of the system pushes frames to this client.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: i64, username: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let conn = Arc::new(Connection::new(user_id, username.clone(), tx.clone()));

    // Install in the registry. A second handshake for the same user id
    // replaces the prior entry; the superseded connection is proactively
    // closed rather than left for the reaper to discover.
    if let Some(old) = state.sessions.insert(conn.clone()) {
        tracing::info!(
            user_id,
            old_conn = old.conn_id(),
            "superseding existing connection"
        );
        old.close(CLOSE_REPLACED, "Signed in from another connection");
    }

    // Spawn writer task: forwards mpsc messages to the WebSocket sink.
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    if let Err(e) = store::set_online_status(&state.db, user_id, true, now_millis()).await {
        tracing::warn!(user_id, error = %e, "failed to record online status");
    }

    // Seed the group presence index from persistent membership.
    match store::group_ids_for_user(&state.db, user_id).await {
        Ok(group_ids) => {
            for group_id in group_ids {
                state.groups.add_member(group_id, user_id);
            }
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "failed to load user groups");
        }
    }

    presence::broadcast_user_status(&state, user_id, &username, true);

    replay::send_offline_messages(&state, &conn).await;

    tracing::info!(user_id, username = %username, "connection established");

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses.
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!(user_id, "pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: frames from this connection are handled strictly
    // sequentially, in arrival order.
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_frame(&text, &conn, &state).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(user_id, "ignoring binary message (text protocol)");
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(user_id, reason = ?frame, "client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                // Stream ended — client disconnected
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks, then run the shared teardown.
    writer_handle.abort();
    ping_handle.abort();

    cleanup_connection(&state, &conn).await;

    tracing::info!(user_id, username = %username, "connection closed");
}

/// Shared disconnect teardown, used by the actor on reader-loop exit and by
/// the session reaper. Idempotent: the registry's compare-and-remove admits
/// exactly one teardown per physical connection, so a transport-error
/// callback racing the reaper cannot double-broadcast offline presence, and
/// a superseded connection cannot tear down its replacement.
///
/// Returns true if this call performed the teardown.
pub async fn cleanup_connection(state: &AppState, conn: &Arc<Connection>) -> bool {
    if state
        .sessions
        .remove_if(conn.user_id, conn.conn_id())
        .is_none()
    {
        return false;
    }

    // No group may retain the user as a reachable member.
    state.groups.remove_user_everywhere(conn.user_id);

    // Best-effort transport close; a no-op if already closed.
    conn.close(1000, "");

    if let Err(e) = store::set_online_status(&state.db, conn.user_id, false, now_millis()).await {
        tracing::warn!(user_id = conn.user_id, error = %e, "failed to record offline status");
    }

    presence::broadcast_user_status(state, conn.user_id, &conn.username, false);
    true
}

/// Writer task: receives messages from the mpsc channel and forwards them to
/// the WebSocket sink. Owns the sink; per-recipient send order is channel
/// order.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
