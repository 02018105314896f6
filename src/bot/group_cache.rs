//! Group member cache with a pending set so the member-list RPC fires at
//! most once per group.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct GroupMemberCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    members: HashMap<i64, Vec<(i64, String)>>,
    pending: HashSet<i64>,
}

impl GroupMemberCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_group(&self, group_id: i64) -> bool {
        self.inner
            .lock()
            .members
            .get(&group_id)
            .is_some_and(|m| !m.is_empty())
    }

    pub fn is_pending(&self, group_id: i64) -> bool {
        self.inner.lock().pending.contains(&group_id)
    }

    /// Claim the fetch for a group. Returns false when the group is
    /// already cached or already being fetched.
    pub fn mark_pending(&self, group_id: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.contains(&group_id)
            || inner.members.get(&group_id).is_some_and(|m| !m.is_empty())
        {
            return false;
        }
        inner.pending.insert(group_id);
        true
    }

    pub fn set_members(&self, group_id: i64, members: Vec<(i64, String)>) {
        let mut inner = self.inner.lock();
        inner.pending.remove(&group_id);
        inner.members.insert(group_id, members);
    }

    /// Forget a failed fetch so a later message can retry it.
    pub fn clear_pending(&self, group_id: i64) {
        self.inner.lock().pending.remove(&group_id);
    }

    pub fn member_name(&self, group_id: i64, user_id: i64) -> Option<String> {
        self.inner
            .lock()
            .members
            .get(&group_id)?
            .iter()
            .find(|(id, _)| *id == user_id)
            .map(|(_, name)| name.clone())
    }
}
