use crate::db::DbPool;
use crate::session::{GroupPresenceIndex, SessionRegistry};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections, at most one per user
    pub sessions: SessionRegistry,
    /// Live group membership for fan-out
    pub groups: GroupPresenceIndex,
}
