//! Connection session registry: one live WebSocket connection per user id.
//!
//! Each connection is identified by a process-unique `conn_id` so the
//! teardown path can distinguish "remove my entry" from "remove the entry
//! of the connection that replaced me".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::ws::frame::Frame;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live, authenticated WebSocket connection.
///
/// The handle only enqueues outbound messages; the connection's writer task
/// owns the socket sink and drains the channel. "Open" therefore means the
/// writer task is still alive and holding the receiver.
#[derive(Debug)]
pub struct Connection {
    conn_id: u64,
    pub user_id: i64,
    pub username: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn new(user_id: i64, username: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            username,
            tx,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Whether the transport is still accepting outbound messages.
    /// Callers must treat this as advisory — the connection can close
    /// between this check and a send.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Enqueue a raw WebSocket message. Returns false if the writer task
    /// is gone; the failure is isolated to this connection.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Serialize a frame and enqueue it as a text message.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(user_id = self.user_id, error = %e, "failed to encode frame");
                false
            }
        }
    }

    /// Best-effort close: enqueue a Close frame. Idempotent — closing an
    /// already-closed connection is a no-op, not an error.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }
}

/// In-memory map of user id to live connection. At most one entry per user
/// id at any instant; a second handshake for the same user replaces the
/// prior entry. No operation blocks on I/O.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<i64, Arc<Connection>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection, unconditionally replacing any prior entry for
    /// the same user id. Returns the superseded connection, if any.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let user_id = conn.user_id;
        let replaced = self.inner.insert(user_id, conn);
        tracing::debug!(user_id, replaced = replaced.is_some(), "connection registered");
        replaced
    }

    /// Remove the entry for `user_id` only if it is still the connection
    /// with `conn_id`. This compare-and-remove is the idempotency guard for
    /// the disconnect cleanup path: a late cleanup (or a reaper racing the
    /// actor) cannot evict a replacement connection.
    pub fn remove_if(&self, user_id: i64, conn_id: u64) -> Option<Arc<Connection>> {
        self.inner
            .remove_if(&user_id, |_, conn| conn.conn_id() == conn_id)
            .map(|(_, conn)| conn)
    }

    pub fn get(&self, user_id: i64) -> Option<Arc<Connection>> {
        self.inner.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.inner.contains_key(&user_id)
    }

    /// Point-in-time copy of all live connections, for iteration decoupled
    /// from concurrent mutation (presence broadcast, reaper sweep).
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(user_id: i64) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Connection::new(user_id, format!("user{user_id}"), tx)),
            rx,
        )
    }

    #[test]
    fn at_most_one_connection_per_user() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = test_conn(7);
        let (second, _rx2) = test_conn(7);

        assert!(registry.insert(first.clone()).is_none());
        let replaced = registry.insert(second.clone()).expect("prior entry returned");
        assert_eq!(replaced.conn_id(), first.conn_id());

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(7).expect("entry present").conn_id(),
            second.conn_id()
        );
    }

    #[test]
    fn remove_if_ignores_superseded_conn_id() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = test_conn(3);
        let (second, _rx2) = test_conn(3);
        registry.insert(first.clone());
        registry.insert(second.clone());

        // Cleanup running for the replaced connection must not evict the
        // replacement.
        assert!(registry.remove_if(3, first.conn_id()).is_none());
        assert!(registry.contains(3));

        assert!(registry.remove_if(3, second.conn_id()).is_some());
        assert!(!registry.contains(3));

        // Second removal of the same connection is a no-op.
        assert!(registry.remove_if(3, second.conn_id()).is_none());
    }

    #[test]
    fn open_state_tracks_receiver() {
        let (conn, rx) = test_conn(1);
        assert!(conn.is_open());
        drop(rx);
        assert!(!conn.is_open());
        // Close on a dead connection must not panic or error.
        conn.close(1000, "bye");
    }

    #[test]
    fn snapshot_is_decoupled_from_mutation() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = test_conn(1);
        let (b, _rx_b) = test_conn(2);
        registry.insert(a);
        registry.insert(b.clone());

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);

        registry.remove_if(2, b.conn_id());
        // The snapshot still holds both handles.
        assert_eq!(snap.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
