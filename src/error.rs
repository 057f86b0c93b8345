//! Error types for PeerCall Core

use crate::models::SignalKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Camera/microphone/screen acquisition failed: permission denied or
    /// no device present. Fatal to call initiation, surfaced to the user.
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// A signal could not be delivered. Fatal for offer/answer, ignored
    /// (logged) for ICE candidates at the call sites.
    #[error("Failed to deliver {kind} signal: {reason}")]
    SignalDelivery { kind: SignalKind, reason: String },

    /// Action against a call that already left the actionable state.
    /// Callers treat this as "the call already ended", not a crash.
    #[error("Call not actionable: {0}")]
    CallNotActionable(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// A non-terminal call involving this peer already exists.
    #[error("Call already in progress with {0}")]
    CallInProgress(String),

    #[error("Peer connection failure: {0}")]
    PeerConnection(String),

    #[error("Call store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the "stale action on a finished call" condition, which is
    /// recovered locally rather than shown as a failure.
    pub fn is_not_actionable(&self) -> bool {
        matches!(self, Error::CallNotActionable(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::PeerConnection(e.to_string())
    }
}
