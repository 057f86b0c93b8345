//! Data models for PeerCall

use serde::{Deserialize, Serialize};

// ============================================================================
// Participants
// ============================================================================

/// Denormalized identity triple stamped onto call records for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_file_id: Option<String>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            avatar_file_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Rejected,
}

impl CallStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }
}

/// One attempted or active call session.
///
/// `call_id`, the participant fields, `media` and `created_at` are immutable
/// after creation; `status` moves monotonically along the lifecycle graph;
/// `started_at`/`ended_at` are each set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub caller_name: Option<String>,
    pub callee_name: Option<String>,
    pub caller_avatar: Option<String>,
    pub callee_avatar: Option<String>,
    pub media: MediaKind,
    pub status: CallStatus,
    /// Millisecond UTC timestamps.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Call {
    /// The other participant from `user_id`'s point of view.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }

    /// Whether this call is between the given unordered pair of users.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.caller_id == a && self.callee_id == b)
            || (self.caller_id == b && self.callee_id == a)
    }

    /// Milliseconds elapsed since creation, clamped at zero.
    pub fn ring_elapsed_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.created_at).max(0)
    }
}

/// Creation request for a call record; the store assigns id, status and
/// `created_at`.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub caller: Participant,
    pub callee: Participant,
    pub media: MediaKind,
}

/// Partial update applied to a call record. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl CallPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch for entering `Connected`.
    pub fn connected(now_ms: i64) -> Self {
        Self {
            status: Some(CallStatus::Connected),
            started_at: Some(now_ms),
            ended_at: None,
        }
    }

    /// Patch for entering a terminal state.
    pub fn terminal(status: CallStatus, now_ms: i64) -> Self {
        Self {
            status: Some(status),
            started_at: None,
            ended_at: Some(now_ms),
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice_candidate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced by one peer-connection end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// One candidate network path proposed during connectivity establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: Option<u16>,
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

/// One unit of the offer/answer/ICE exchange, scoped to a call.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub call_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub payload: SignalPayload,
    pub created_at: i64,
}

impl Signal {
    pub fn new(
        call_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            payload,
            created_at: now_ms(),
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self.payload {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// Current UTC time in milliseconds, the timestamp convention used across
/// all records.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_of_resolves_both_directions() {
        let call = Call {
            call_id: "c1".into(),
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            caller_name: None,
            callee_name: None,
            caller_avatar: None,
            callee_avatar: None,
            media: MediaKind::Audio,
            status: CallStatus::Ringing,
            created_at: 0,
            started_at: None,
            ended_at: None,
        };
        assert_eq!(call.peer_of("alice"), "bob");
        assert_eq!(call.peer_of("bob"), "alice");
        assert!(call.involves_pair("bob", "alice"));
        assert!(!call.involves_pair("alice", "carol"));
    }

    #[test]
    fn signal_payload_round_trips_as_json() {
        let signal = Signal::new(
            "c1",
            "alice",
            "bob",
            SignalPayload::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 UDP 2122260223 192.0.2.1 54321 typ host".into(),
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".into()),
            }),
        );
        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), SignalKind::IceCandidate);
        assert_eq!(back.payload, signal.payload);
    }
}
