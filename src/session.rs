//! Per-call session actor
//!
//! One tokio task per call consumes every event source through a single
//! `select!` loop: user commands, inbound signals, peer-connection events,
//! call-record updates and a housekeeping tick. Nothing outside the task
//! mutates session state; observers read a `watch`-published snapshot and
//! a shared track list. Every event application first checks for a
//! terminal status, so operations completing after cancellation no-op
//! instead of resurrecting torn-down state.

use crate::config::CallConfig;
use crate::error::Result;
use crate::lifecycle;
use crate::media::{ConnectionState, MediaBackend, MediaSession, MediaTrack, PeerEvent};
use crate::models::{now_ms, Call, CallPatch, CallStatus};
use crate::signaling::{Role, SignalingCoordinator};
use crate::store::{CallStore, CallUpdates, SignalChannel, SignalStream};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    End,
    ToggleAudio,
    ToggleVideo,
    StartScreenShare,
    StopScreenShare,
}

/// Observable state of one call, published on every change and every tick.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call: Call,
    pub link: ConnectionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    /// Seconds since `started_at` while connected.
    pub connected_secs: i64,
}

impl CallSnapshot {
    pub fn status(&self) -> CallStatus {
        self.call.status
    }
}

#[derive(Default)]
struct SharedTracks {
    local: RwLock<Vec<Arc<dyn MediaTrack>>>,
    remote: RwLock<Vec<Arc<dyn MediaTrack>>>,
}

/// Cheap handle to a running session. Commands are fire-and-forget: once
/// the session is gone the call is over and the command is moot.
#[derive(Clone)]
pub struct SessionHandle {
    call_id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    tracks: Arc<SharedTracks>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A fresh receiver for awaiting snapshot changes.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Block until the call reaches a terminal status.
    pub async fn wait_terminal(&self) -> CallSnapshot {
        let mut rx = self.snapshot.clone();
        loop {
            if rx.borrow().call.status.is_terminal() {
                return rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    pub fn end(&self) {
        let _ = self.commands.send(SessionCommand::End);
    }

    pub fn toggle_audio(&self) {
        let _ = self.commands.send(SessionCommand::ToggleAudio);
    }

    pub fn toggle_video(&self) {
        let _ = self.commands.send(SessionCommand::ToggleVideo);
    }

    pub fn start_screen_share(&self) {
        let _ = self.commands.send(SessionCommand::StartScreenShare);
    }

    pub fn stop_screen_share(&self) {
        let _ = self.commands.send(SessionCommand::StopScreenShare);
    }

    pub fn local_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.local.read().clone()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.remote.read().clone()
    }
}

pub(crate) struct CallSession {
    call: Call,
    coordinator: SignalingCoordinator,
    store: Arc<dyn CallStore>,
    signals: Arc<dyn SignalChannel>,
    config: CallConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signal_rx: SignalStream,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    call_rx: CallUpdates,
    snapshot_tx: watch::Sender<CallSnapshot>,
    link: ConnectionState,
    tracks: Arc<SharedTracks>,
}

impl CallSession {
    /// Build the session, run the role's eager protocol steps, then hand
    /// the event loop to a spawned task. Errors during these eager steps
    /// (device refusal, offer delivery) propagate to the initiating caller
    /// and leave the call record terminal.
    pub(crate) async fn spawn(
        role: Role,
        call: Call,
        local_id: &str,
        store: Arc<dyn CallStore>,
        signals: Arc<dyn SignalChannel>,
        backend: Arc<dyn MediaBackend>,
        config: CallConfig,
    ) -> Result<SessionHandle> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let media = MediaSession::new(backend, call.media);
        let mut coordinator = SignalingCoordinator::new(
            &call,
            local_id,
            role,
            media,
            signals.clone(),
            config.ice_servers.clone(),
            peer_tx,
        );

        if role == Role::Caller {
            if let Err(e) = coordinator.start_caller().await {
                coordinator.teardown().await;
                // Initiation failed before anyone could pick up; close the
                // record so the callee stops ringing.
                let _ = store
                    .update(
                        &call.call_id,
                        CallPatch::terminal(CallStatus::Ended, now_ms()),
                    )
                    .await;
                return Err(e);
            }
        }

        let signal_rx = signals.subscribe(&call.call_id, local_id);
        let call_rx = store.subscribe(&call.call_id);
        let tracks = Arc::new(SharedTracks::default());

        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            call: call.clone(),
            link: ConnectionState::New,
            audio_enabled: coordinator.media().audio_enabled(),
            video_enabled: coordinator.media().video_enabled(),
            screen_sharing: false,
            connected_secs: 0,
        });

        let handle = SessionHandle {
            call_id: call.call_id.clone(),
            commands: command_tx,
            snapshot: snapshot_rx,
            tracks: tracks.clone(),
        };

        let session = CallSession {
            call,
            coordinator,
            store,
            signals,
            config,
            commands: command_rx,
            signal_rx,
            peer_rx,
            call_rx,
            snapshot_tx,
            link: ConnectionState::New,
            tracks,
        };
        tokio::spawn(session.run());

        Ok(handle)
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(signal) = self.signal_rx.recv() => self.on_signal(signal).await,
                Some(event) = self.peer_rx.recv() => self.on_peer_event(event).await,
                Some(update) = self.call_rx.recv() => self.on_call_update(update),
                _ = tick.tick() => self.on_tick().await,
            }

            self.publish();
            if self.call.status.is_terminal() {
                break;
            }
        }

        self.finish().await;
    }

    async fn on_command(&mut self, command: SessionCommand) {
        if self.call.status.is_terminal() {
            return;
        }
        match command {
            SessionCommand::End => self.end_call(CallStatus::Ended).await,
            SessionCommand::ToggleAudio => self.coordinator.media().toggle_audio(),
            SessionCommand::ToggleVideo => self.coordinator.media().toggle_video(),
            SessionCommand::StartScreenShare => {
                if let Err(e) = self.coordinator.media_mut().start_screen_share().await {
                    tracing::warn!("Screen share failed for {}: {e}", self.call.call_id);
                }
            }
            SessionCommand::StopScreenShare => {
                if let Err(e) = self.coordinator.media_mut().stop_screen_share().await {
                    tracing::warn!("Stopping screen share failed for {}: {e}", self.call.call_id);
                }
            }
        }
    }

    async fn on_signal(&mut self, signal: crate::models::Signal) {
        if self.call.status.is_terminal() {
            return;
        }
        if let Err(e) = self.coordinator.handle_signal(signal).await {
            // Post-initiation failures have no recovery path; fold them
            // into a normal hangup.
            tracing::warn!("Signaling failed for {}: {e}", self.call.call_id);
            self.end_call(CallStatus::Ended).await;
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        if self.call.status.is_terminal() {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.coordinator.publish_candidate(candidate).await;
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::debug!("Remote track {} for call {}", track.id(), self.call.call_id);
                self.coordinator.media_mut().push_remote_track(track);
            }
            PeerEvent::StateChanged(state) => {
                self.link = state;
                if state.is_fatal() {
                    tracing::info!(
                        "Peer connection {state:?} for {}; ending call",
                        self.call.call_id
                    );
                    self.end_call(CallStatus::Ended).await;
                }
            }
        }
    }

    /// A store update arrived, possibly from the remote side: adopt it.
    fn on_call_update(&mut self, update: Call) {
        if self.call.status.is_terminal() {
            return;
        }
        if update.call_id == self.call.call_id {
            self.call = update;
        }
    }

    async fn on_tick(&mut self) {
        match self.call.status {
            CallStatus::Ringing => {
                let now = now_ms();
                match lifecycle::auto_reject_if_overdue(
                    self.store.as_ref(),
                    &self.call,
                    now,
                    self.config.ring_timeout,
                )
                .await
                {
                    Ok(true) => {
                        self.call.status = CallStatus::Rejected;
                        self.call.ended_at.get_or_insert(now);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Ring timeout check failed for {}: {e}", self.call.call_id)
                    }
                }
            }
            CallStatus::Connected => {
                // The platform may stop a screen capture without notice;
                // detect it and revert the substitution.
                if self.coordinator.media().screen_share_ended() {
                    if let Err(e) = self.coordinator.media_mut().stop_screen_share().await {
                        tracing::warn!(
                            "Reverting ended screen share failed for {}: {e}",
                            self.call.call_id
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Drive the call to a terminal status, tolerating having lost the
    /// race to some other writer.
    async fn end_call(&mut self, to: CallStatus) {
        if self.call.status.is_terminal() {
            return;
        }
        let now = now_ms();
        match self
            .store
            .update(&self.call.call_id, CallPatch::terminal(to, now))
            .await
        {
            Ok(updated) => self.call = updated,
            Err(e) if e.is_not_actionable() => {
                if let Ok(Some(current)) = self.store.get(&self.call.call_id).await {
                    self.call = current;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to record call end for {}: {e}", self.call.call_id);
            }
        }
        // Whatever the store said, this session is over.
        if !self.call.status.is_terminal() {
            self.call.status = to;
            self.call.ended_at.get_or_insert(now);
        }
    }

    fn publish(&self) {
        let media = self.coordinator.media();
        *self.tracks.local.write() = media.local_tracks();
        *self.tracks.remote.write() = media.remote_tracks();

        let connected_secs = match (self.call.status, self.call.started_at) {
            (CallStatus::Connected, Some(started)) => ((now_ms() - started) / 1000).max(0),
            _ => 0,
        };
        self.snapshot_tx.send_replace(CallSnapshot {
            call: self.call.clone(),
            link: self.link,
            audio_enabled: media.audio_enabled(),
            video_enabled: media.video_enabled(),
            screen_sharing: media.is_screen_sharing(),
            connected_secs,
        });
    }

    /// Terminal cleanup: teardown now, purge signals later.
    async fn finish(mut self) {
        self.coordinator.teardown().await;
        self.publish();

        let signals = self.signals.clone();
        let call_id = self.call.call_id.clone();
        let delay = self.config.signal_purge_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = signals.purge(&call_id).await {
                tracing::debug!("Signal purge for {call_id} failed: {e}");
            }
        });

        tracing::info!(
            "Call {} finished with status {:?}",
            self.call.call_id,
            self.call.status
        );
    }
}
