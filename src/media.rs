//! Media session: local media, the peer connection, and track lifecycle
//!
//! Platform media APIs are behind the `MediaBackend`/`PeerConnection`/
//! `MediaTrack` traits. Peer-connection callbacks are reified as
//! [`PeerEvent`] messages sent into the owning session's channel, so late
//! callbacks after teardown land on a dropped receiver and disappear
//! instead of mutating shared state.

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::models::{IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One local or remote media track.
///
/// Track state may change without notification on some platforms (a user
/// can stop a screen capture from the OS picker), so consumers poll
/// `enabled()`/`ended()` on their housekeeping tick.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// The underlying source is gone (device unplugged, capture stopped).
    fn ended(&self) -> bool;
    /// Release the underlying device. Idempotent.
    fn stop(&self);
    /// Downcast hook for backends that need their own concrete track type.
    fn as_any(&self) -> &dyn std::any::Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that must drive the call to `Ended`.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// The three peer-connection callback contracts, as messages.
#[derive(Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was produced; zero or more, asynchronously,
    /// possibly after logical teardown.
    LocalCandidate(IceCandidate),
    /// The far side added media.
    RemoteTrack(Arc<dyn MediaTrack>),
    /// Connection state moved.
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// One end of a peer-to-peer connection, offer/answer + trickled ICE.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Attach a local track for outbound transmission.
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;
    /// In-place substitution of the outbound video track, no renegotiation.
    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;
    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Platform media entry points: device capture and connection building.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Camera + microphone for a video call, microphone only for audio.
    async fn open_user_media(&self, media: MediaKind) -> Result<Vec<Arc<dyn MediaTrack>>>;

    /// A screen/window capture track.
    async fn open_display_media(&self) -> Result<Arc<dyn MediaTrack>>;

    /// Build a connection for `call_id`, delivering its callbacks as
    /// [`PeerEvent`]s on `events`.
    async fn new_connection(
        &self,
        call_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

// ============================================================================
// Media session
// ============================================================================

/// Runtime media state of one call, exclusively owned by its session.
pub struct MediaSession {
    backend: Arc<dyn MediaBackend>,
    media: MediaKind,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    remote_tracks: Vec<Arc<dyn MediaTrack>>,
    connection: Option<Arc<dyn PeerConnection>>,
    /// Camera track parked while a screen capture takes its place.
    original_camera: Option<Arc<dyn MediaTrack>>,
    screen_track: Option<Arc<dyn MediaTrack>>,
    acquired: bool,
    torn_down: bool,
}

impl MediaSession {
    pub fn new(backend: Arc<dyn MediaBackend>, media: MediaKind) -> Self {
        Self {
            backend,
            media,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            connection: None,
            original_camera: None,
            screen_track: None,
            acquired: false,
            torn_down: false,
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media
    }

    /// Request devices from the platform. At most once per session without
    /// an intervening teardown.
    pub async fn acquire_local_media(&mut self) -> Result<()> {
        if self.acquired {
            return Err(Error::MediaAccess(
                "local media already acquired for this session".into(),
            ));
        }
        let tracks = self.backend.open_user_media(self.media).await?;
        tracing::debug!("Acquired {} local track(s)", tracks.len());
        self.local_tracks = tracks;
        self.acquired = true;
        self.torn_down = false;
        Ok(())
    }

    pub async fn create_peer_connection(
        &mut self,
        call_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<()> {
        let connection = self
            .backend
            .new_connection(call_id, ice_servers, events)
            .await?;
        self.connection = Some(connection);
        Ok(())
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    fn connection(&self) -> Result<&Arc<dyn PeerConnection>> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::PeerConnection("no peer connection".into()))
    }

    /// Attach every local track to the connection for outbound transmission.
    pub async fn add_local_tracks(&mut self) -> Result<()> {
        let connection = self.connection()?.clone();
        for track in &self.local_tracks {
            connection.add_track(track.clone()).await?;
        }
        Ok(())
    }

    pub fn connection_handle(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.clone()
    }

    fn local_track(&self, kind: TrackKind) -> Option<&Arc<dyn MediaTrack>> {
        self.local_tracks.iter().find(|t| t.kind() == kind)
    }

    /// Flip the audio track's enabled flag. Silently a no-op without one.
    pub fn toggle_audio(&self) {
        if let Some(track) = self.local_track(TrackKind::Audio) {
            track.set_enabled(!track.enabled());
        }
    }

    /// Flip the video track's enabled flag. Silently a no-op without one
    /// (audio-only calls carry no video track).
    pub fn toggle_video(&self) {
        if let Some(track) = self.local_track(TrackKind::Video) {
            track.set_enabled(!track.enabled());
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.local_track(TrackKind::Audio)
            .map(|t| t.enabled())
            .unwrap_or(false)
    }

    pub fn video_enabled(&self) -> bool {
        self.local_track(TrackKind::Video)
            .map(|t| t.enabled())
            .unwrap_or(false)
    }

    /// The track currently feeding outbound video: the camera, or the
    /// screen capture while sharing.
    pub fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.local_track(TrackKind::Video).cloned()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_track.is_some()
    }

    /// The capture was stopped out-of-band (platform UI); the session tick
    /// polls this and reverts the substitution.
    pub fn screen_share_ended(&self) -> bool {
        self.screen_track.as_ref().map(|t| t.ended()).unwrap_or(false)
    }

    /// Substitute the outbound camera track with a fresh screen capture.
    /// No renegotiation; the local track list is swapped too so preview
    /// follows the share.
    pub async fn start_screen_share(&mut self) -> Result<()> {
        if self.screen_track.is_some() {
            return Ok(());
        }
        let camera = self
            .local_track(TrackKind::Video)
            .cloned()
            .ok_or_else(|| Error::MediaAccess("screen share requires a video call".into()))?;

        let capture = self.backend.open_display_media().await?;
        self.connection()?.replace_video_track(capture.clone()).await?;

        self.swap_local_video(&camera.id().to_string(), capture.clone());
        self.original_camera = Some(camera);
        self.screen_track = Some(capture);
        tracing::info!("Screen share started");
        Ok(())
    }

    /// Restore the parked camera track. No-op when not sharing.
    pub async fn stop_screen_share(&mut self) -> Result<()> {
        let (Some(capture), Some(camera)) =
            (self.screen_track.take(), self.original_camera.take())
        else {
            return Ok(());
        };

        self.connection()?.replace_video_track(camera.clone()).await?;
        self.swap_local_video(&capture.id().to_string(), camera);
        capture.stop();
        tracing::info!("Screen share stopped");
        Ok(())
    }

    fn swap_local_video(&mut self, outgoing_id: &str, incoming: Arc<dyn MediaTrack>) {
        self.local_tracks.retain(|t| t.id() != outgoing_id);
        self.local_tracks.push(incoming);
    }

    pub fn push_remote_track(&mut self, track: Arc<dyn MediaTrack>) {
        self.remote_tracks.push(track);
    }

    pub fn local_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.local_tracks.clone()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.remote_tracks.clone()
    }

    /// Local tracks whose device is still held. Zero after teardown.
    pub fn live_local_tracks(&self) -> usize {
        self.local_tracks.iter().filter(|t| !t.ended()).count()
            + self
                .screen_track
                .iter()
                .filter(|t| !t.ended())
                .count()
    }

    /// Stop every local track, close the connection, release everything.
    /// Idempotent.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.acquired = false;

        for track in &self.local_tracks {
            track.stop();
        }
        if let Some(track) = self.screen_track.take() {
            track.stop();
        }
        self.original_camera = None;
        self.local_tracks.clear();
        self.remote_tracks.clear();

        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        tracing::debug!("Media session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackMedia;

    async fn video_session_with_connection() -> (MediaSession, mpsc::UnboundedReceiver<PeerEvent>)
    {
        let backend = Arc::new(LoopbackMedia::new());
        let mut session = MediaSession::new(backend, MediaKind::Video);
        let (tx, rx) = mpsc::unbounded_channel();
        session.acquire_local_media().await.unwrap();
        session
            .create_peer_connection("c1", &[], tx)
            .await
            .unwrap();
        session.add_local_tracks().await.unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn acquire_twice_without_release_fails() {
        let backend = Arc::new(LoopbackMedia::new());
        let mut session = MediaSession::new(backend, MediaKind::Audio);
        session.acquire_local_media().await.unwrap();
        assert!(matches!(
            session.acquire_local_media().await,
            Err(Error::MediaAccess(_))
        ));

        // Teardown releases; a fresh acquire succeeds again.
        session.teardown().await;
        session.acquire_local_media().await.unwrap();
    }

    #[tokio::test]
    async fn toggles_are_involutions_and_independent() {
        let (session, _rx) = video_session_with_connection().await;

        assert!(session.audio_enabled());
        assert!(session.video_enabled());

        session.toggle_audio();
        assert!(!session.audio_enabled());
        assert!(session.video_enabled());

        session.toggle_audio();
        assert!(session.audio_enabled());
        assert!(session.video_enabled());

        session.toggle_video();
        session.toggle_video();
        assert!(session.video_enabled());
    }

    #[tokio::test]
    async fn toggle_video_is_a_no_op_on_audio_calls() {
        let backend = Arc::new(LoopbackMedia::new());
        let mut session = MediaSession::new(backend, MediaKind::Audio);
        session.acquire_local_media().await.unwrap();

        assert!(!session.video_enabled());
        session.toggle_video();
        assert!(!session.video_enabled());
        assert!(session.audio_enabled());
    }

    #[tokio::test]
    async fn screen_share_round_trip_restores_the_camera_track() {
        let (mut session, _rx) = video_session_with_connection().await;
        let camera = session.video_track().unwrap();

        session.start_screen_share().await.unwrap();
        assert!(session.is_screen_sharing());
        let share = session.video_track().unwrap();
        assert_ne!(share.id(), camera.id());

        session.stop_screen_share().await.unwrap();
        assert!(!session.is_screen_sharing());
        let restored = session.video_track().unwrap();
        assert_eq!(restored.id(), camera.id());
        assert!(Arc::ptr_eq(&restored, &camera));
        // Stopping again is a no-op.
        session.stop_screen_share().await.unwrap();
    }

    #[tokio::test]
    async fn screen_share_requires_video() {
        let backend = Arc::new(LoopbackMedia::new());
        let mut session = MediaSession::new(backend.clone(), MediaKind::Audio);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.acquire_local_media().await.unwrap();
        session.create_peer_connection("c1", &[], tx).await.unwrap();
        session.add_local_tracks().await.unwrap();

        assert!(matches!(
            session.start_screen_share().await,
            Err(Error::MediaAccess(_))
        ));
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_releases_tracks() {
        let (mut session, _rx) = video_session_with_connection().await;
        assert_eq!(session.live_local_tracks(), 2);

        session.teardown().await;
        assert_eq!(session.live_local_tracks(), 0);

        // Second teardown must not panic or error.
        session.teardown().await;
    }
}
