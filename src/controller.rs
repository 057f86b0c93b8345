//! Call controller: the narrow command surface handed to the UI layer
//!
//! One instance per logged-in user. Owns the collaborator handles, the
//! directory of ringing incoming calls, and at most one active session.
//! All state is owned here and passed by handle — no ambient globals.

use crate::config::CallConfig;
use crate::directory::CallDirectory;
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::media::MediaBackend;
use crate::models::{now_ms, Call, CallPatch, CallStatus, MediaKind, NewCall, Participant};
use crate::session::{CallSession, SessionHandle};
use crate::signaling::Role;
use crate::store::{CallStore, SignalChannel};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct CallController {
    local: Participant,
    store: Arc<dyn CallStore>,
    signals: Arc<dyn SignalChannel>,
    backend: Arc<dyn MediaBackend>,
    config: CallConfig,
    directory: Arc<CallDirectory>,
    active: Mutex<Option<SessionHandle>>,
    incoming_tx: watch::Sender<Vec<Call>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        local: Participant,
        store: Arc<dyn CallStore>,
        signals: Arc<dyn SignalChannel>,
        backend: Arc<dyn MediaBackend>,
        config: CallConfig,
    ) -> Self {
        let (incoming_tx, _) = watch::channel(Vec::new());
        Self {
            local,
            store,
            signals,
            backend,
            config,
            directory: Arc::new(CallDirectory::new()),
            active: Mutex::new(None),
            incoming_tx,
            watcher: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.local.user_id
    }

    /// Start the incoming-call watcher: feeds the directory from the store
    /// subscription and auto-rejects calls that out-ring their window, each
    /// on its own clock.
    pub fn start(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }

        let store = self.store.clone();
        let directory = self.directory.clone();
        let incoming_tx = self.incoming_tx.clone();
        let ring_timeout = self.config.ring_timeout;
        let tick_interval = self.config.tick_interval;
        let user_id = self.local.user_id.clone();

        *watcher = Some(tokio::spawn(async move {
            let mut ringing = store.subscribe_ringing(&user_id);
            let mut tick = tokio::time::interval(tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    maybe = ringing.recv() => {
                        let Some(call) = maybe else { break };
                        if call.status == CallStatus::Ringing {
                            tracing::info!(
                                "Incoming {} call {} from {}",
                                match call.media { MediaKind::Audio => "audio", MediaKind::Video => "video" },
                                call.call_id,
                                call.caller_id
                            );
                            directory.insert(call);
                        } else {
                            directory.remove(&call.call_id);
                        }
                    }
                    _ = tick.tick() => {
                        let now = now_ms();
                        for call in directory.overdue(now, ring_timeout) {
                            match lifecycle::auto_reject_if_overdue(
                                store.as_ref(), &call, now, ring_timeout,
                            ).await {
                                Ok(_) => directory.remove(&call.call_id),
                                Err(e) => tracing::warn!(
                                    "Auto-reject of {} failed: {e}", call.call_id
                                ),
                            }
                        }
                    }
                }
                incoming_tx.send_replace(directory.snapshot());
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    fn active_non_terminal(&self) -> Option<SessionHandle> {
        self.active
            .lock()
            .as_ref()
            .filter(|h| !h.snapshot().call.status.is_terminal())
            .cloned()
    }

    /// Place a call. Fails fast with `CallInProgress` while another call
    /// involving this user is live, with `MediaAccess` if devices are
    /// refused, and with `SignalDelivery` if the offer cannot be sent; in
    /// those cases the created record is already closed out and the UI
    /// stays in its pre-call state.
    pub async fn initiate(
        &self,
        callee: Participant,
        media: MediaKind,
    ) -> Result<SessionHandle> {
        if let Some(active) = self.active_non_terminal() {
            return Err(Error::CallInProgress(
                active.snapshot().call.peer_of(&self.local.user_id).to_string(),
            ));
        }

        let call = self
            .store
            .create(NewCall {
                caller: self.local.clone(),
                callee,
                media,
            })
            .await?;
        tracing::info!(
            "Initiating {:?} call {} to {}",
            media,
            call.call_id,
            call.callee_id
        );

        let handle = CallSession::spawn(
            Role::Caller,
            call,
            &self.local.user_id,
            self.store.clone(),
            self.signals.clone(),
            self.backend.clone(),
            self.config.clone(),
        )
        .await?;

        *self.active.lock() = Some(handle.clone());
        Ok(handle)
    }

    /// Accept a ringing incoming call. A call that already left `Ringing`
    /// (cancelled, timed out, taken elsewhere) fails with
    /// `CallNotActionable` and mutates nothing.
    pub async fn accept(&self, call_id: &str) -> Result<SessionHandle> {
        // An unknown id and a call that moved on are the same situation
        // from the user's chair: the call is no longer there to take.
        let call = self
            .store
            .get(call_id)
            .await?
            .ok_or_else(|| Error::CallNotActionable(call_id.to_string()))?;

        if call.callee_id != self.local.user_id || call.status != CallStatus::Ringing {
            return Err(Error::CallNotActionable(call_id.to_string()));
        }
        if let Some(active) = self.active_non_terminal() {
            return Err(Error::CallInProgress(
                active.snapshot().call.peer_of(&self.local.user_id).to_string(),
            ));
        }

        let call = self
            .store
            .update(call_id, CallPatch::connected(now_ms()))
            .await?;
        self.directory.remove(call_id);
        self.incoming_tx.send_replace(self.directory.snapshot());

        let handle = CallSession::spawn(
            Role::Callee,
            call,
            &self.local.user_id,
            self.store.clone(),
            self.signals.clone(),
            self.backend.clone(),
            self.config.clone(),
        )
        .await?;

        tracing::info!("Accepted call {call_id}");
        *self.active.lock() = Some(handle.clone());
        Ok(handle)
    }

    /// Decline a ringing incoming call. Same staleness contract as
    /// [`accept`](Self::accept).
    pub async fn reject(&self, call_id: &str) -> Result<()> {
        let call = self
            .store
            .get(call_id)
            .await?
            .ok_or_else(|| Error::CallNotActionable(call_id.to_string()))?;

        if call.callee_id != self.local.user_id || call.status != CallStatus::Ringing {
            return Err(Error::CallNotActionable(call_id.to_string()));
        }

        self.store
            .update(call_id, CallPatch::terminal(CallStatus::Rejected, now_ms()))
            .await?;
        self.directory.remove(call_id);
        self.incoming_tx.send_replace(self.directory.snapshot());
        tracing::info!("Rejected call {call_id}");
        Ok(())
    }

    /// Hang up the active call, if any. Idempotent.
    pub fn end(&self) {
        if let Some(handle) = self.active.lock().as_ref() {
            handle.end();
        }
    }

    /// The current session handle, terminal or not.
    pub fn active(&self) -> Option<SessionHandle> {
        self.active.lock().clone()
    }

    /// Ringing calls addressed to this user, right now.
    pub fn incoming(&self) -> Vec<Call> {
        self.directory.snapshot()
    }

    /// Watch the ringing-call list as it changes.
    pub fn watch_incoming(&self) -> watch::Receiver<Vec<Call>> {
        self.incoming_tx.subscribe()
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}
