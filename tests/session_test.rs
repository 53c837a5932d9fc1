//! Integration tests for session lifecycle: idempotent teardown, supersede
//! protection, and the periodic reaper sweep.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use chatroom_server::session::{Connection, GroupPresenceIndex, SessionRegistry};
use chatroom_server::state::AppState;
use chatroom_server::ws::actor::cleanup_connection;
use chatroom_server::ws::reaper::reap_closed_sessions;

/// Build an AppState over a throwaway database, no HTTP listener.
fn test_state() -> (AppState, tempfile::TempDir) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let db = chatroom_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = chatroom_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    (
        AppState {
            db,
            jwt_secret,
            sessions: SessionRegistry::new(),
            groups: GroupPresenceIndex::new(),
        },
        tmp_dir,
    )
}

fn test_conn(user_id: i64) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(Connection::new(user_id, format!("user{user_id}"), tx)),
        rx,
    )
}

/// Count frames of a given type currently queued on a connection's channel.
fn count_frames(rx: &mut mpsc::UnboundedReceiver<Message>, frame_type: &str) -> usize {
    let mut count = 0;
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == frame_type {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn test_cleanup_runs_exactly_once() {
    let (state, _tmp) = test_state();

    let (conn, _rx) = test_conn(1);
    let (observer, mut observer_rx) = test_conn(2);
    state.sessions.insert(conn.clone());
    state.sessions.insert(observer);
    state.groups.add_member(10, 1);

    assert!(cleanup_connection(&state, &conn).await);
    // Second teardown of the same physical connection is a no-op.
    assert!(!cleanup_connection(&state, &conn).await);

    assert!(!state.sessions.contains(1));
    assert!(!state.groups.is_tracked(10, 1));

    // The observer saw exactly one USER_OFFLINE despite two cleanup calls.
    assert_eq!(count_frames(&mut observer_rx, "USER_OFFLINE"), 1);
}

#[tokio::test]
async fn test_superseded_connection_cannot_tear_down_replacement() {
    let (state, _tmp) = test_state();

    let (first, _rx1) = test_conn(5);
    let (second, _rx2) = test_conn(5);

    state.sessions.insert(first.clone());
    let replaced = state.sessions.insert(second.clone());
    assert_eq!(replaced.unwrap().conn_id(), first.conn_id());
    state.groups.add_member(20, 5);

    // The stale connection's teardown must not strip the live user's state.
    assert!(!cleanup_connection(&state, &first).await);
    assert!(state.sessions.contains(5));
    assert!(state.groups.is_tracked(20, 5));

    // The live connection's teardown works normally.
    assert!(cleanup_connection(&state, &second).await);
    assert!(!state.sessions.contains(5));
}

#[tokio::test]
async fn test_reaper_evicts_closed_sessions() {
    let (state, _tmp) = test_state();

    let (alive, _alive_rx) = test_conn(1);
    let (dead_a, dead_a_rx) = test_conn(2);
    let (dead_b, dead_b_rx) = test_conn(3);
    state.sessions.insert(alive);
    state.sessions.insert(dead_a);
    state.sessions.insert(dead_b);
    state.groups.add_member(30, 2);

    // Dropping the receivers simulates writer tasks that died without a
    // clean disconnect (network partition, killed process).
    drop(dead_a_rx);
    drop(dead_b_rx);

    assert_eq!(reap_closed_sessions(&state).await, 2);
    assert!(state.sessions.contains(1));
    assert!(!state.sessions.contains(2));
    assert!(!state.sessions.contains(3));
    assert!(!state.groups.is_tracked(30, 2));

    // A second sweep finds nothing.
    assert_eq!(reap_closed_sessions(&state).await, 0);
}

#[tokio::test]
async fn test_reaper_leaves_chatty_sessions_alone() {
    let (state, _tmp) = test_state();

    let (conn, mut rx) = test_conn(7);
    state.sessions.insert(conn.clone());

    assert_eq!(reap_closed_sessions(&state).await, 0);
    assert!(state.sessions.contains(7));

    // The survivor can still be written to.
    assert!(conn.send_frame(&chatroom_server::ws::frame::Frame::system("hello")));
    assert!(rx.try_recv().is_ok());
}
