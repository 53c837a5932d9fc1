//! Session reaper: periodic sweep that evicts connections whose transport
//! closed without a clean disconnect event.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::state::AppState;
use crate::ws::actor;

/// Fixed sweep period. Not configurable at the core boundary.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the background reaper task. Runs for the life of the process.
pub fn spawn_session_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(REAP_INTERVAL);
        // Skip the first immediate tick
        timer.tick().await;

        loop {
            timer.tick().await;
            let evicted = reap_closed_sessions(&state).await;
            if evicted > 0 {
                tracing::info!(evicted, "reaped dead sessions");
            }
        }
    })
}

/// One sweep: snapshot the registry and run the shared cleanup path for
/// every entry whose transport reports closed (not merely idle). Eviction
/// removes the registry entry, strips the user from every group in the
/// presence index, best-effort closes the transport, and broadcasts
/// USER_OFFLINE — all through the same idempotent path the actor uses, so
/// racing an actor's own teardown is harmless.
///
/// Public so tests can drive a sweep without waiting for the timer.
pub async fn reap_closed_sessions(state: &AppState) -> usize {
    let mut evicted = 0;
    for conn in state.sessions.snapshot() {
        if conn.is_open() {
            continue;
        }
        if actor::cleanup_connection(state, &conn).await {
            tracing::debug!(user_id = conn.user_id, "reaped closed connection");
            evicted += 1;
        }
    }
    evicted
}
