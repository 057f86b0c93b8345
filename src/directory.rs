//! Directory of calls currently ringing toward the local user
//!
//! The only state shared across the whole process. It is only ever appended
//! to or filtered by id — never mutated element-wise — so concurrent
//! readers always see a consistent list.

use crate::models::Call;
use parking_lot::RwLock;
use std::time::Duration;

#[derive(Default)]
pub struct CallDirectory {
    ringing: RwLock<Vec<Call>>,
}

impl CallDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ringing call; a call id already present is left untouched.
    pub fn insert(&self, call: Call) {
        let mut ringing = self.ringing.write();
        if ringing.iter().any(|c| c.call_id == call.call_id) {
            return;
        }
        ringing.push(call);
    }

    pub fn remove(&self, call_id: &str) {
        self.ringing.write().retain(|c| c.call_id != call_id);
    }

    pub fn snapshot(&self) -> Vec<Call> {
        self.ringing.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.ringing.read().is_empty()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.ringing.read().iter().any(|c| c.call_id == call_id)
    }

    /// Whether any listed call involves the given peer.
    pub fn has_call_with(&self, user_id: &str) -> bool {
        self.ringing
            .read()
            .iter()
            .any(|c| c.caller_id == user_id || c.callee_id == user_id)
    }

    /// Calls that out-rang their window, each judged against its own
    /// `created_at`.
    pub fn overdue(&self, now_ms: i64, ring_timeout: Duration) -> Vec<Call> {
        self.ringing
            .read()
            .iter()
            .filter(|c| crate::lifecycle::ring_expired(c, now_ms, ring_timeout))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CallStatus, MediaKind};

    fn call(id: &str, created_at: i64) -> Call {
        Call {
            call_id: id.into(),
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            caller_name: None,
            callee_name: None,
            caller_avatar: None,
            callee_avatar: None,
            media: MediaKind::Audio,
            status: CallStatus::Ringing,
            created_at,
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn insert_is_id_deduplicated() {
        let dir = CallDirectory::new();
        dir.insert(call("c1", 0));
        dir.insert(call("c1", 0));
        assert_eq!(dir.snapshot().len(), 1);
    }

    #[test]
    fn remove_filters_by_id() {
        let dir = CallDirectory::new();
        dir.insert(call("c1", 0));
        dir.insert(call("c2", 0));
        dir.remove("c1");
        assert!(!dir.contains("c1"));
        assert!(dir.contains("c2"));
    }

    #[test]
    fn each_call_times_out_on_its_own_clock() {
        let dir = CallDirectory::new();
        dir.insert(call("old", 0));
        dir.insert(call("new", 50_000));

        let overdue = dir.overdue(61_000, Duration::from_secs(60));
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].call_id, "old");
    }
}
