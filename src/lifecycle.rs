//! Call lifecycle state machine
//!
//! States: `Ringing` (initial) → `Connected` → `Ended`; `Ringing` →
//! `Rejected`; `Ringing` → `Ended` (caller cancel or timeout). Terminal
//! states admit nothing. The ring timeout is recomputed against wall-clock
//! elapsed time on every tick rather than armed once, so a consumer that
//! re-subscribes mid-ring still rejects on schedule.

use crate::error::{Error, Result};
use crate::models::{Call, CallPatch, CallStatus};
use crate::store::CallStore;
use std::time::Duration;

/// The directed transition graph. Everything not listed here is invalid.
pub fn can_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Ringing, Connected) | (Ringing, Rejected) | (Ringing, Ended) | (Connected, Ended)
    )
}

/// Validate a status move, mapping violations to `CallNotActionable`.
pub fn check_transition(call: &Call, to: CallStatus) -> Result<()> {
    if can_transition(call.status, to) {
        Ok(())
    } else {
        Err(Error::CallNotActionable(call.call_id.clone()))
    }
}

/// Whether an unanswered call has out-rung its window.
pub fn ring_expired(call: &Call, now_ms: i64, ring_timeout: Duration) -> bool {
    call.status == CallStatus::Ringing
        && call.ring_elapsed_ms(now_ms) >= ring_timeout.as_millis() as i64
}

/// Reject `call` if it is still ringing past its window. Returns `true` if
/// this invocation performed the transition. Safe to invoke any number of
/// times from any number of watchers: the store's monotonic-transition
/// guard lets exactly one attempt win, and losing attempts report `false`.
pub async fn auto_reject_if_overdue(
    store: &dyn CallStore,
    call: &Call,
    now_ms: i64,
    ring_timeout: Duration,
) -> Result<bool> {
    if !ring_expired(call, now_ms, ring_timeout) {
        return Ok(false);
    }

    match store
        .update(
            &call.call_id,
            CallPatch::terminal(CallStatus::Rejected, now_ms),
        )
        .await
    {
        Ok(_) => {
            tracing::info!("Call {} auto-rejected after ring timeout", call.call_id);
            Ok(true)
        }
        Err(e) if e.is_not_actionable() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaKind, NewCall, Participant};
    use crate::store::MemoryCallStore;

    fn ringing_call(created_at: i64) -> Call {
        Call {
            call_id: "c1".into(),
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
    fn transition_graph_admits_only_the_four_edges() {
        use CallStatus::*;
        let all = [Ringing, Connected, Ended, Rejected];
        for from in all {
            for to in all {
                let allowed = can_transition(from, to);
                let expected = matches!(
                    (from, to),
                    (Ringing, Connected)
                        | (Ringing, Rejected)
                        | (Ringing, Ended)
                        | (Connected, Ended)
                );
                assert_eq!(allowed, expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        use CallStatus::*;
        for from in [Ended, Rejected] {
            for to in [Ringing, Connected, Ended, Rejected] {
                assert!(!can_transition(from, to));
            }
        }
    }

    #[test]
    fn ring_expiry_is_computed_from_created_at() {
        let timeout = Duration::from_secs(60);
        let call = ringing_call(1_000_000);
        assert!(!ring_expired(&call, 1_000_000 + 59_999, timeout));
        assert!(ring_expired(&call, 1_000_000 + 60_000, timeout));

        let mut connected = ringing_call(1_000_000);
        connected.status = CallStatus::Connected;
        assert!(!ring_expired(&connected, 1_000_000 + 120_000, timeout));
    }

    #[tokio::test]
    async fn auto_reject_fires_exactly_once() {
        let store = MemoryCallStore::new();
        let call = store
            .create(NewCall {
                caller: Participant::new("alice"),
                callee: Participant::new("bob"),
                media: MediaKind::Audio,
            })
            .await
            .unwrap();

        let overdue = call.created_at + 61_000;
        let timeout = Duration::from_secs(60);

        let first = auto_reject_if_overdue(&store, &call, overdue, timeout)
            .await
            .unwrap();
        let second = auto_reject_if_overdue(&store, &call, overdue, timeout)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let stored = store.get(&call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Rejected);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn auto_reject_is_a_no_op_before_the_deadline() {
        let store = MemoryCallStore::new();
        let call = store
            .create(NewCall {
                caller: Participant::new("alice"),
                callee: Participant::new("bob"),
                media: MediaKind::Audio,
            })
            .await
            .unwrap();

        let fired = auto_reject_if_overdue(
            &store,
            &call,
            call.created_at + 1_000,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!(!fired);
        let stored = store.get(&call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
    }
}
