//! External collaborator contracts: call record store and signal channel
//!
//! The controller never opens a socket itself; persistence and delivery are
//! behind these traits. The in-memory implementations below are the
//! reference behavior (and the test/demo transport): the store enforces the
//! monotonic-transition invariant, the channel replays already-appended
//! signals to late subscribers before streaming new ones.

use crate::error::{Error, Result};
use crate::lifecycle;
use crate::models::{Call, CallPatch, CallStatus, NewCall, Signal};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Stream of call record updates. Dropping the receiver unsubscribes.
pub type CallUpdates = mpsc::UnboundedReceiver<Call>;

/// Stream of signals addressed to one (call, receiver) pair.
pub type SignalStream = mpsc::UnboundedReceiver<Signal>;

#[async_trait]
pub trait CallStore: Send + Sync {
    /// Persist a new call record; the store assigns id, `Ringing` status
    /// and `created_at`.
    async fn create(&self, new_call: NewCall) -> Result<Call>;

    async fn get(&self, call_id: &str) -> Result<Option<Call>>;

    /// Apply a partial update and return the updated record. Status moves
    /// must follow the lifecycle graph; violations fail with
    /// `CallNotActionable` and mutate nothing.
    async fn update(&self, call_id: &str, patch: CallPatch) -> Result<Call>;

    /// Updates for a single call, starting with its current state.
    fn subscribe(&self, call_id: &str) -> CallUpdates;

    /// Updates for calls addressed to `recipient_id`, starting with the
    /// currently ringing ones. Consumers filter on status; a call leaving
    /// `Ringing` is announced through the same stream.
    fn subscribe_ringing(&self, recipient_id: &str) -> CallUpdates;
}

#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Append one signal. Call sites treat failure as fatal for
    /// offer/answer and best-effort for ICE candidates.
    async fn append(&self, signal: Signal) -> Result<()>;

    /// Signals addressed to `receiver_id` within `call_id`: replays what
    /// was already appended, in append order, then streams new arrivals.
    fn subscribe(&self, call_id: &str, receiver_id: &str) -> SignalStream;

    /// Best-effort removal of a finished call's signals.
    async fn purge(&self, call_id: &str) -> Result<()>;
}

// ============================================================================
// In-memory call store
// ============================================================================

enum WatchFilter {
    Call(String),
    Recipient(String),
}

struct CallWatcher {
    filter: WatchFilter,
    tx: mpsc::UnboundedSender<Call>,
}

impl CallWatcher {
    fn wants(&self, call: &Call) -> bool {
        match &self.filter {
            WatchFilter::Call(id) => call.call_id == *id,
            WatchFilter::Recipient(user) => call.callee_id == *user,
        }
    }
}

#[derive(Default)]
struct CallStoreInner {
    calls: HashMap<String, Call>,
    watchers: Vec<CallWatcher>,
}

/// Reference `CallStore`: a guarded map plus fan-out to subscribers.
#[derive(Default)]
pub struct MemoryCallStore {
    inner: Mutex<CallStoreInner>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(inner: &mut CallStoreInner, call: &Call) {
        inner
            .watchers
            .retain(|w| !w.wants(call) || w.tx.send(call.clone()).is_ok());
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create(&self, new_call: NewCall) -> Result<Call> {
        let mut inner = self.inner.lock();

        // One non-terminal call per unordered pair.
        if let Some(existing) = inner.calls.values().find(|c| {
            !c.status.is_terminal()
                && c.involves_pair(&new_call.caller.user_id, &new_call.callee.user_id)
        }) {
            return Err(Error::CallInProgress(
                existing.peer_of(&new_call.caller.user_id).to_string(),
            ));
        }

        let call = Call {
            call_id: uuid::Uuid::new_v4().to_string(),
            caller_id: new_call.caller.user_id,
            callee_id: new_call.callee.user_id,
            caller_name: new_call.caller.display_name,
            callee_name: new_call.callee.display_name,
            caller_avatar: new_call.caller.avatar_file_id,
            callee_avatar: new_call.callee.avatar_file_id,
            media: new_call.media,
            status: CallStatus::Ringing,
            created_at: crate::models::now_ms(),
            started_at: None,
            ended_at: None,
        };

        inner.calls.insert(call.call_id.clone(), call.clone());
        Self::notify(&mut inner, &call);
        Ok(call)
    }

    async fn get(&self, call_id: &str) -> Result<Option<Call>> {
        Ok(self.inner.lock().calls.get(call_id).cloned())
    }

    async fn update(&self, call_id: &str, patch: CallPatch) -> Result<Call> {
        let mut inner = self.inner.lock();
        let call = inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;

        if let Some(to) = patch.status {
            lifecycle::check_transition(call, to)?;
            call.status = to;
        }
        // started_at/ended_at are each set exactly once.
        if let Some(ts) = patch.started_at {
            call.started_at.get_or_insert(ts);
        }
        if let Some(ts) = patch.ended_at {
            call.ended_at.get_or_insert(ts);
        }

        let updated = call.clone();
        Self::notify(&mut inner, &updated);
        Ok(updated)
    }

    fn subscribe(&self, call_id: &str) -> CallUpdates {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(call) = inner.calls.get(call_id) {
            let _ = tx.send(call.clone());
        }
        inner.watchers.push(CallWatcher {
            filter: WatchFilter::Call(call_id.to_string()),
            tx,
        });
        rx
    }

    fn subscribe_ringing(&self, recipient_id: &str) -> CallUpdates {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for call in inner.calls.values() {
            if call.callee_id == recipient_id && call.status == CallStatus::Ringing {
                let _ = tx.send(call.clone());
            }
        }
        inner.watchers.push(CallWatcher {
            filter: WatchFilter::Recipient(recipient_id.to_string()),
            tx,
        });
        rx
    }
}

// ============================================================================
// In-memory signal channel
// ============================================================================

struct SignalSub {
    call_id: String,
    receiver_id: String,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Default)]
struct SignalChannelInner {
    log: Vec<Signal>,
    subs: Vec<SignalSub>,
}

/// Reference `SignalChannel`: an append-only log with replay-then-live
/// subscriptions.
#[derive(Default)]
pub struct MemorySignalChannel {
    inner: Mutex<SignalChannelInner>,
}

impl MemorySignalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalChannel for MemorySignalChannel {
    async fn append(&self, signal: Signal) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.subs.retain(|s| {
            s.call_id != signal.call_id
                || s.receiver_id != signal.receiver_id
                || s.tx.send(signal.clone()).is_ok()
        });
        inner.log.push(signal);
        Ok(())
    }

    fn subscribe(&self, call_id: &str, receiver_id: &str) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for signal in &inner.log {
            if signal.call_id == call_id && signal.receiver_id == receiver_id {
                let _ = tx.send(signal.clone());
            }
        }
        inner.subs.push(SignalSub {
            call_id: call_id.to_string(),
            receiver_id: receiver_id.to_string(),
            tx,
        });
        rx
    }

    async fn purge(&self, call_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.log.retain(|s| s.call_id != call_id);
        inner.subs.retain(|s| s.call_id != call_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        IceCandidate, MediaKind, Participant, SdpKind, SessionDescription, SignalPayload,
    };

    fn new_call(caller: &str, callee: &str) -> NewCall {
        NewCall {
            caller: Participant::new(caller),
            callee: Participant::new(callee),
            media: MediaKind::Video,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_rings() {
        let store = MemoryCallStore::new();
        let call = store.create(new_call("alice", "bob")).await.unwrap();
        assert!(!call.call_id.is_empty());
        assert_eq!(call.status, CallStatus::Ringing);
        assert!(call.created_at > 0);
        assert!(call.started_at.is_none());
    }

    #[tokio::test]
    async fn second_call_for_same_pair_is_refused() {
        let store = MemoryCallStore::new();
        store.create(new_call("alice", "bob")).await.unwrap();

        // Same pair in either direction is refused while non-terminal.
        assert!(matches!(
            store.create(new_call("bob", "alice")).await,
            Err(Error::CallInProgress(_))
        ));

        // Unrelated pair is fine.
        store.create(new_call("alice", "carol")).await.unwrap();
    }

    #[tokio::test]
    async fn update_rejects_invalid_transitions() {
        let store = MemoryCallStore::new();
        let call = store.create(new_call("alice", "bob")).await.unwrap();

        store
            .update(&call.call_id, CallPatch::terminal(CallStatus::Rejected, 1))
            .await
            .unwrap();

        // Terminal states admit nothing, including re-termination.
        for to in [
            CallStatus::Ringing,
            CallStatus::Connected,
            CallStatus::Ended,
            CallStatus::Rejected,
        ] {
            let err = store
                .update(&call.call_id, CallPatch::status(to))
                .await
                .unwrap_err();
            assert!(err.is_not_actionable(), "{to:?}");
        }

        let stored = store.get(&call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Rejected);
    }

    #[tokio::test]
    async fn started_and_ended_are_set_once() {
        let store = MemoryCallStore::new();
        let call = store.create(new_call("alice", "bob")).await.unwrap();

        let connected = store
            .update(&call.call_id, CallPatch::connected(100))
            .await
            .unwrap();
        assert_eq!(connected.started_at, Some(100));

        let ended = store
            .update(
                &call.call_id,
                CallPatch {
                    status: Some(CallStatus::Ended),
                    started_at: Some(999),
                    ended_at: Some(200),
                },
            )
            .await
            .unwrap();
        assert_eq!(ended.started_at, Some(100));
        assert_eq!(ended.ended_at, Some(200));
    }

    #[tokio::test]
    async fn subscribe_ringing_replays_and_streams() {
        let store = MemoryCallStore::new();
        let first = store.create(new_call("alice", "bob")).await.unwrap();

        let mut updates = store.subscribe_ringing("bob");
        assert_eq!(updates.recv().await.unwrap().call_id, first.call_id);

        let second = store.create(new_call("carol", "bob")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().call_id, second.call_id);

        // Status changes for the recipient's calls arrive on the same stream.
        store
            .update(&first.call_id, CallPatch::terminal(CallStatus::Ended, 1))
            .await
            .unwrap();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.call_id, first.call_id);
        assert_eq!(update.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn signal_subscription_replays_in_append_order() {
        let channel = MemorySignalChannel::new();
        let candidate = |n: u16| {
            SignalPayload::IceCandidate(IceCandidate {
                candidate: format!("candidate:{n}"),
                sdp_mline_index: Some(n),
                sdp_mid: None,
            })
        };

        channel
            .append(Signal::new("c1", "alice", "bob", candidate(0)))
            .await
            .unwrap();
        channel
            .append(Signal::new("c1", "alice", "bob", candidate(1)))
            .await
            .unwrap();
        // Different receiver and different call must not leak in.
        channel
            .append(Signal::new("c1", "bob", "alice", candidate(2)))
            .await
            .unwrap();
        channel
            .append(Signal::new("c2", "carol", "bob", candidate(3)))
            .await
            .unwrap();

        let mut stream = channel.subscribe("c1", "bob");
        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            SignalPayload::IceCandidate(IceCandidate { sdp_mline_index: Some(0), .. })
        ));
        assert!(matches!(
            second.payload,
            SignalPayload::IceCandidate(IceCandidate { sdp_mline_index: Some(1), .. })
        ));

        // Live delivery after replay.
        channel
            .append(Signal::new(
                "c1",
                "alice",
                "bob",
                SignalPayload::Offer(SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(
            stream.recv().await.unwrap().payload,
            SignalPayload::Offer(_)
        ));
    }

    #[tokio::test]
    async fn purge_clears_a_calls_signals() {
        let channel = MemorySignalChannel::new();
        channel
            .append(Signal::new(
                "c1",
                "alice",
                "bob",
                SignalPayload::Offer(SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                }),
            ))
            .await
            .unwrap();

        channel.purge("c1").await.unwrap();

        let mut stream = channel.subscribe("c1", "bob");
        assert!(stream.try_recv().is_err());
    }
}
