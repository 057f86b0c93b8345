//! In-process media backend
//!
//! Pairs the two ends of a call through a shared hub: descriptions are
//! exchanged by the signaling layer as usual, but "media" never leaves the
//! process. Used by the integration tests, and usable for demos on
//! machines without devices. Both participants must hold the same
//! `LoopbackMedia` instance.

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{
    ConnectionState, MediaBackend, MediaTrack, PeerConnection, PeerEvent, TrackKind,
};
use crate::models::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Tracks
// ============================================================================

pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl LoopbackTrack {
    fn new(kind: TrackKind, label: &str) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{label}-{}", uuid::Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Default)]
struct ConnState {
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: Vec<Arc<dyn MediaTrack>>,
    video_out: Option<Arc<dyn MediaTrack>>,
    connected: bool,
    closed: bool,
}

pub struct LoopbackConnection {
    id: String,
    call_id: String,
    hub: Arc<Hub>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<ConnState>,
}

impl LoopbackConnection {
    /// Candidates applied so far; lets tests assert none were dropped.
    pub fn applied_candidates(&self) -> usize {
        self.state.lock().candidates.len()
    }

    /// Id of the track currently feeding outbound video.
    pub fn outbound_video_id(&self) -> Option<String> {
        self.state
            .lock()
            .video_out
            .as_ref()
            .map(|t| t.id().to_string())
    }

    fn counterpart(&self) -> Option<Arc<LoopbackConnection>> {
        self.hub
            .calls
            .lock()
            .get(&self.call_id)?
            .iter()
            .find(|c| c.id != self.id)
            .cloned()
    }

    fn descriptions_complete(&self) -> bool {
        let state = self.state.lock();
        state.local_desc.is_some() && state.remote_desc.is_some()
    }

    /// Once both ends hold both descriptions, flip each to connected and
    /// cross-deliver the tracks present so far.
    fn try_link(&self) {
        let Some(peer) = self.counterpart() else {
            return;
        };
        if !self.descriptions_complete() || !peer.descriptions_complete() {
            return;
        }

        for (end, other) in [(self, &*peer), (&*peer, self)] {
            let tracks = {
                let mut state = end.state.lock();
                if state.connected || state.closed {
                    continue;
                }
                state.connected = true;
                state.tracks.clone()
            };
            let _ = end
                .events
                .send(PeerEvent::StateChanged(ConnectionState::Connected));
            for track in tracks {
                let _ = other.events.send(PeerEvent::RemoteTrack(track));
            }
        }
    }

    fn fail_if_closed(&self) -> Result<()> {
        if self.state.lock().closed {
            Err(Error::PeerConnection("connection is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.fail_if_closed()?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 loopback-offer {}", self.id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.fail_if_closed()?;
        if self.state.lock().remote_desc.is_none() {
            return Err(Error::PeerConnection(
                "cannot answer before a remote offer".into(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 loopback-answer {}", self.id),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.fail_if_closed()?;
        self.state.lock().local_desc = Some(desc);

        // Trickle a couple of host candidates, as a real agent would.
        for (index, port) in [(0u16, 40000u16), (1, 40001)] {
            let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{index} 1 UDP 2122252543 198.51.100.1 {port} typ host"
                ),
                sdp_mline_index: Some(index),
                sdp_mid: Some(index.to_string()),
            }));
        }

        self.try_link();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.fail_if_closed()?;
        self.state.lock().remote_desc = Some(desc);
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.fail_if_closed()?;
        let mut state = self.state.lock();
        // Same contract as a real agent: candidates need a remote
        // description first. The coordinator buffers early arrivals.
        if state.remote_desc.is_none() {
            return Err(Error::PeerConnection(
                "remote description not set".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        self.fail_if_closed()?;
        let connected = {
            let mut state = self.state.lock();
            if track.kind() == TrackKind::Video {
                state.video_out = Some(track.clone());
            }
            state.tracks.push(track.clone());
            state.connected
        };
        if connected {
            if let Some(peer) = self.counterpart() {
                let _ = peer.events.send(PeerEvent::RemoteTrack(track));
            }
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        self.fail_if_closed()?;
        let mut state = self.state.lock();
        if state.video_out.is_none() {
            return Err(Error::PeerConnection("no outbound video sender".into()));
        }
        state.tracks.retain(|t| t.kind() != TrackKind::Video);
        state.tracks.push(track.clone());
        state.video_out = Some(track);
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
        }
        // The far side observes a disconnect, as over a real transport.
        if let Some(peer) = self.counterpart() {
            let _ = peer
                .events
                .send(PeerEvent::StateChanged(ConnectionState::Disconnected));
        }
        let _ = self
            .events
            .send(PeerEvent::StateChanged(ConnectionState::Closed));

        let mut calls = self.hub.calls.lock();
        let now_empty = match calls.get_mut(&self.call_id) {
            Some(ends) => {
                ends.retain(|c| c.id != self.id);
                ends.is_empty()
            }
            None => false,
        };
        if now_empty {
            calls.remove(&self.call_id);
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
struct Hub {
    calls: Mutex<HashMap<String, Vec<Arc<LoopbackConnection>>>>,
}

#[derive(Default, Clone)]
pub struct LoopbackMedia {
    hub: Arc<Hub>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handles to a call's connections, oldest first. Test hook.
    pub fn connections(&self, call_id: &str) -> Vec<Arc<LoopbackConnection>> {
        self.hub
            .calls
            .lock()
            .get(call_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaBackend for LoopbackMedia {
    async fn open_user_media(&self, media: MediaKind) -> Result<Vec<Arc<dyn MediaTrack>>> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        tracks.push(LoopbackTrack::new(TrackKind::Audio, "mic"));
        if media.has_video() {
            tracks.push(LoopbackTrack::new(TrackKind::Video, "camera"));
        }
        Ok(tracks)
    }

    async fn open_display_media(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(LoopbackTrack::new(TrackKind::Video, "screen"))
    }

    async fn new_connection(
        &self,
        call_id: &str,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(LoopbackConnection {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            hub: self.hub.clone(),
            events,
            state: Mutex::new(ConnState::default()),
        });

        self.hub
            .calls
            .lock()
            .entry(call_id.to_string())
            .or_default()
            .push(connection.clone());

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linked_ends_exchange_tracks_and_connect() {
        let media = LoopbackMedia::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = media.new_connection("c1", &[], tx_a).await.unwrap();
        let b = media.new_connection("c1", &[], tx_b).await.unwrap();

        let mic_a = LoopbackTrack::new(TrackKind::Audio, "mic");
        a.add_track(mic_a.clone()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut a_connected = false;
        let mut b_saw_track = false;
        while let Ok(event) = rx_a.try_recv() {
            if matches!(event, PeerEvent::StateChanged(ConnectionState::Connected)) {
                a_connected = true;
            }
        }
        while let Ok(event) = rx_b.try_recv() {
            if let PeerEvent::RemoteTrack(track) = event {
                assert_eq!(track.id(), mic_a.id());
                b_saw_track = true;
            }
        }
        assert!(a_connected);
        assert!(b_saw_track);
    }

    #[tokio::test]
    async fn early_candidates_are_refused_like_a_real_agent() {
        let media = LoopbackMedia::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = media.new_connection("c1", &[], tx).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 1 198.51.100.1 40000 typ host".into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        };
        assert!(conn.add_ice_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn close_notifies_the_far_side() {
        let media = LoopbackMedia::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = media.new_connection("c1", &[], tx_a).await.unwrap();
        let _b = media.new_connection("c1", &[], tx_b).await.unwrap();

        a.close().await;
        let mut b_disconnected = false;
        while let Ok(event) = rx_b.try_recv() {
            if matches!(
                event,
                PeerEvent::StateChanged(ConnectionState::Disconnected)
            ) {
                b_disconnected = true;
            }
        }
        assert!(b_disconnected);
        assert!(media.connections("c1").len() == 1);
    }
}
