//! Signaling coordinator: offer/answer/ICE exchange for one call
//!
//! Translates inbound signals into peer-connection operations and local
//! peer-connection output into outbound signals. Signals are processed in
//! arrival order, but no order is assumed across kinds: ICE candidates
//! legitimately arrive before the offer/answer and are buffered until the
//! remote description is in place (the peer-connection primitive refuses
//! earlier application).

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{MediaSession, PeerEvent};
use crate::models::{Call, IceCandidate, Signal, SignalKind, SignalPayload};
use crate::store::SignalChannel;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the call; sends the offer.
    Caller,
    /// Accepted the call; answers the offer.
    Callee,
}

pub struct SignalingCoordinator {
    call_id: String,
    local_id: String,
    remote_id: String,
    role: Role,
    media: MediaSession,
    signals: Arc<dyn SignalChannel>,
    ice_servers: Vec<IceServer>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl SignalingCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call: &Call,
        local_id: &str,
        role: Role,
        media: MediaSession,
        signals: Arc<dyn SignalChannel>,
        ice_servers: Vec<IceServer>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            call_id: call.call_id.clone(),
            local_id: local_id.to_string(),
            remote_id: call.peer_of(local_id).to_string(),
            role,
            media,
            signals,
            ice_servers,
            peer_events,
            pending_candidates: Vec::new(),
            remote_description_set: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn media(&self) -> &MediaSession {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut MediaSession {
        &mut self.media
    }

    /// Acquire devices, build the connection and attach local tracks, once.
    /// The caller side runs this eagerly; the callee side runs it lazily on
    /// the first inbound signal.
    async fn ensure_connection(&mut self) -> Result<()> {
        if self.media.has_connection() {
            return Ok(());
        }
        self.media.acquire_local_media().await?;
        self.media
            .create_peer_connection(&self.call_id, &self.ice_servers, self.peer_events.clone())
            .await?;
        self.media.add_local_tracks().await?;
        Ok(())
    }

    /// Initiator protocol, step one: media, connection, offer out.
    /// Offer delivery is fatal to the call on failure.
    pub async fn start_caller(&mut self) -> Result<()> {
        self.ensure_connection().await?;

        let connection = self
            .media
            .connection_handle()
            .ok_or_else(|| Error::PeerConnection("no peer connection".into()))?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        self.signals
            .append(Signal::new(
                self.call_id.clone(),
                self.local_id.clone(),
                self.remote_id.clone(),
                SignalPayload::Offer(offer),
            ))
            .await
            .map_err(|e| Error::SignalDelivery {
                kind: SignalKind::Offer,
                reason: e.to_string(),
            })?;

        tracing::debug!("Offer sent for call {}", self.call_id);
        Ok(())
    }

    /// Apply one inbound signal. Signals for another call are discarded
    /// without error.
    pub async fn handle_signal(&mut self, signal: Signal) -> Result<()> {
        if signal.call_id != self.call_id {
            tracing::debug!(
                "Discarding signal for unknown call {} (session is {})",
                signal.call_id,
                self.call_id
            );
            return Ok(());
        }

        self.ensure_connection().await?;
        let connection = self
            .media
            .connection_handle()
            .ok_or_else(|| Error::PeerConnection("no peer connection".into()))?;

        match signal.payload {
            SignalPayload::Offer(desc) => {
                connection.set_remote_description(desc).await?;
                self.remote_description_set = true;
                self.drain_pending_candidates().await;

                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;

                self.signals
                    .append(Signal::new(
                        self.call_id.clone(),
                        self.local_id.clone(),
                        signal.sender_id.clone(),
                        SignalPayload::Answer(answer),
                    ))
                    .await
                    .map_err(|e| Error::SignalDelivery {
                        kind: SignalKind::Answer,
                        reason: e.to_string(),
                    })?;
                tracing::debug!("Answer sent for call {}", self.call_id);
            }
            SignalPayload::Answer(desc) => {
                connection.set_remote_description(desc).await?;
                self.remote_description_set = true;
                self.drain_pending_candidates().await;
            }
            SignalPayload::IceCandidate(candidate) => {
                if !self.remote_description_set {
                    self.pending_candidates.push(candidate);
                    return Ok(());
                }
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    // Candidates are redundant by design; one bad apply
                    // must not abort the call.
                    tracing::warn!("Dropping ICE candidate for {}: {e}", self.call_id);
                }
            }
        }
        Ok(())
    }

    async fn drain_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let Some(connection) = self.media.connection_handle() else {
            return;
        };
        tracing::debug!(
            "Applying {} buffered ICE candidate(s) for {}",
            self.pending_candidates.len(),
            self.call_id
        );
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Dropping buffered ICE candidate for {}: {e}", self.call_id);
            }
        }
    }

    /// Send a locally gathered candidate to the peer. Best-effort: delivery
    /// failure is logged and swallowed.
    pub async fn publish_candidate(&self, candidate: IceCandidate) {
        let result = self
            .signals
            .append(Signal::new(
                self.call_id.clone(),
                self.local_id.clone(),
                self.remote_id.clone(),
                SignalPayload::IceCandidate(candidate),
            ))
            .await;
        if let Err(e) = result {
            tracing::warn!(
                "Failed to deliver ICE candidate for {}: {e}",
                self.call_id
            );
        }
    }

    pub async fn teardown(&mut self) {
        self.media.teardown().await;
    }
}
