//! Runtime call counters behind the admin stats routes.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Statistics {
    total_api_calls: AtomicU64,
    group_calls: Mutex<BTreeMap<i64, u64>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// `group_id` of 0 counts as a private-chat call.
    pub fn record_api_call(&self, group_id: i64) {
        self.total_api_calls.fetch_add(1, Ordering::Relaxed);
        if group_id > 0 {
            *self.group_calls.lock().entry(group_id).or_default() += 1;
        }
    }

    pub fn total_api_calls(&self) -> u64 {
        self.total_api_calls.load(Ordering::Relaxed)
    }

    pub fn active_group_count(&self) -> usize {
        self.group_calls.lock().len()
    }

    pub fn group_calls(&self) -> Vec<(i64, u64)> {
        self.group_calls
            .lock()
            .iter()
            .map(|(id, count)| (*id, *count))
            .collect()
    }
}
