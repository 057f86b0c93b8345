//! WebRTC media backend
//!
//! Production [`MediaBackend`] over the `webrtc` crate: STUN/TURN-configured
//! peer connections with the default codec and interceptor set, Opus/VP8
//! sample tracks, and `RTCRtpSender::replace_track` for screen-share
//! substitution.
//!
//! Device capture is platform-specific and lives with the embedding
//! application: it obtains the [`RtcLocalTrack`]s from the session's track
//! list, checks `enabled()`, and writes captured samples into
//! [`RtcLocalTrack::sample_track`].

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{
    ConnectionState, MediaBackend, MediaTrack, PeerConnection, PeerEvent, TrackKind,
};
use crate::models::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// Tracks
// ============================================================================

/// A local sample track plus the mute flag the sample pump honors.
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl RtcLocalTrack {
    fn new(kind: TrackKind, label: &str, mime_type: &str) -> Arc<Self> {
        let id = format!("{label}-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "peercall".to_owned(),
        ));
        Arc::new(Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }

    /// The underlying sample sink for the capture pipeline.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl MediaTrack for RtcLocalTrack {
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

/// An inbound track as surfaced by `on_track`.
pub struct RtcRemoteTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    /// The underlying remote track for the render pipeline.
    pub fn remote(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        true
    }

    // Muting the far side is the far side's business.
    fn set_enabled(&self, _enabled: bool) {}

    fn ended(&self) -> bool {
        false
    }

    fn stop(&self) {}

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn as_sample_track(track: &Arc<dyn MediaTrack>) -> Result<Arc<TrackLocalStaticSample>> {
    track
        .as_any()
        .downcast_ref::<RtcLocalTrack>()
        .map(|t| t.sample_track())
        .ok_or_else(|| Error::PeerConnection("track was not created by this backend".into()))
}

// ============================================================================
// Connection
// ============================================================================

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    /// Sender feeding outbound video; the substitution point for screen
    /// sharing.
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeerConnection {
    fn description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
        };
        Ok(parsed)
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(Self::description(&desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(Self::description(&desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let kind = track.kind();
        let sample = as_sample_track(&track)?;
        let sender = self
            .pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        if kind == TrackKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| Error::PeerConnection("no outbound video sender".into()))?;
        let sample = as_sample_track(&track)?;
        sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Peer connection close: {e}");
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct RtcMedia {
    api: API,
}

impl RtcMedia {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }

    fn rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
        ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl MediaBackend for RtcMedia {
    async fn open_user_media(&self, media: MediaKind) -> Result<Vec<Arc<dyn MediaTrack>>> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        tracks.push(RtcLocalTrack::new(TrackKind::Audio, "mic", MIME_TYPE_OPUS));
        if media.has_video() {
            tracks.push(RtcLocalTrack::new(TrackKind::Video, "camera", MIME_TYPE_VP8));
        }
        Ok(tracks)
    }

    async fn open_display_media(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(RtcLocalTrack::new(TrackKind::Video, "screen", MIME_TYPE_VP8))
    }

    async fn new_connection(
        &self,
        call_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: Self::rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        tracing::debug!("Created peer connection for call {call_id}");

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let wrapped = Arc::new(RtcRemoteTrack {
                    id: format!("remote-{}", track.ssrc()),
                    kind,
                    track,
                });
                let _ = tx.send(PeerEvent::RemoteTrack(wrapped));
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => ConnectionState::New,
                };
                let _ = tx.send(PeerEvent::StateChanged(mapped));
            })
        }));

        Ok(Arc::new(RtcPeerConnection {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_media_matches_the_call_kind() {
        let backend = RtcMedia::new().unwrap();

        let audio_only = backend.open_user_media(MediaKind::Audio).await.unwrap();
        assert_eq!(audio_only.len(), 1);
        assert_eq!(audio_only[0].kind(), TrackKind::Audio);

        let video = backend.open_user_media(MediaKind::Video).await.unwrap();
        assert_eq!(video.len(), 2);
        assert!(video.iter().any(|t| t.kind() == TrackKind::Video));
    }

    #[tokio::test]
    async fn local_tracks_toggle_and_stop() {
        let backend = RtcMedia::new().unwrap();
        let tracks = backend.open_user_media(MediaKind::Audio).await.unwrap();
        let mic = &tracks[0];

        assert!(mic.enabled());
        mic.set_enabled(false);
        assert!(!mic.enabled());

        assert!(!mic.ended());
        mic.stop();
        assert!(mic.ended());
    }

    #[tokio::test]
    async fn connection_builds_and_closes() {
        let backend = RtcMedia::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = backend
            .new_connection("c1", &[IceServer::stun("stun:stun.l.google.com:19302")], tx)
            .await
            .unwrap();
        connection.close().await;
    }
}
