//! Group presence index: which users are currently reachable within a group.
//!
//! This index is not authoritative for group membership — the group_members
//! table is. It only tracks "currently reachable", is seeded from persistent
//! membership at connect time, and is mutated thereafter by JOIN_GROUP /
//! LEAVE_GROUP frames and the disconnect cleanup path.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::SessionRegistry;

#[derive(Clone, Default)]
pub struct GroupPresenceIndex {
    inner: Arc<DashMap<i64, HashSet<i64>>>,
}

impl GroupPresenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: adding a user already tracked in the group is a no-op.
    pub fn add_member(&self, group_id: i64, user_id: i64) {
        self.inner.entry(group_id).or_default().insert(user_id);
        tracing::debug!(group_id, user_id, "user tracked in group");
    }

    /// Idempotent: removing an untracked user is a no-op.
    pub fn remove_member(&self, group_id: i64, user_id: i64) {
        if let Some(mut members) = self.inner.get_mut(&group_id) {
            members.remove(&user_id);
        }
    }

    /// Tracked members of the group that also have a live registry entry.
    /// Staleness (a tracked member whose connection is gone but not yet
    /// reaped) is filtered here at read time rather than eagerly.
    pub fn online_members(&self, group_id: i64, registry: &SessionRegistry) -> Vec<i64> {
        match self.inner.get(&group_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|user_id| registry.contains(*user_id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove the user from every group; invoked once per disconnect so no
    /// group retains a stale member. Empty groups are dropped from the map.
    pub fn remove_user_everywhere(&self, user_id: i64) {
        self.inner.retain(|_, members| {
            members.remove(&user_id);
            !members.is_empty()
        });
    }

    /// Whether the user is tracked in the given group.
    pub fn is_tracked(&self, group_id: i64, user_id: i64) -> bool {
        self.inner
            .get(&group_id)
            .map(|members| members.contains(&user_id))
            .unwrap_or(false)
    }

    pub fn group_count(&self) -> usize {
        self.inner.len()
    }
}
