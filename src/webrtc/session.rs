//! WebRTC Session negotiation
//!
//! One [`Session`] per remote camera. The viewer is always the offerer:
//! - `IDLE` until negotiation is triggered
//! - `NEGOTIATING` once the offer has been sent
//! - `CONNECTED` when the link reports established connectivity
//! - `FAILED`, `DISCONNECTED` or `CLOSED` are terminal; recovery needs a
//!   fresh request
//!
//! Every suspending link call (relay lookup, link creation, offer, answer
//! and candidates) runs on a per-session negotiation worker. The worker
//! consumes signals from a queue in arrival order and reports its outcome
//! through the session's tagged event sink, so the event loop never waits on
//! the media layer.

use super::data_channel::ControlState;
use super::ice_servers::IceServerSource;
use super::link::{
    LinkEventSink, LinkFactory, LinkReady, LinkState, MediaLink, RemoteTrack, SessionEvent,
    SessionEventKind,
};
use super::monitor::{self, LinkHealth};
use super::signaling::{IceCandidate, SdpType, SignalPayload};
use super::SessionError;
use crate::transport::message::Envelope;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Remote camera identity plus local viewer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub remote: String,
    pub local: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.remote, self.local)
    }
}

/// Negotiation lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Failed | SessionPhase::Disconnected | SessionPhase::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "IDLE",
            SessionPhase::Negotiating => "NEGOTIATING",
            SessionPhase::Connected => "CONNECTED",
            SessionPhase::Failed => "FAILED",
            SessionPhase::Disconnected => "DISCONNECTED",
            SessionPhase::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a session handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub phase: SessionPhase,
    pub stream: Option<RemoteTrack>,
    pub last_error: Option<SessionError>,
    pub control: ControlState,
    pub health: Option<LinkHealth>,
}

/// Everything a session needs to start negotiating.
pub struct NegotiationContext {
    pub factory: Arc<dyn LinkFactory>,
    pub ice: IceServerSource,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Label of the auxiliary control channel, if one should be opened.
    pub control_label: Option<String>,
    pub monitor_interval: Duration,
    pub stall_threshold: Duration,
}

/// Per-camera negotiation state.
pub struct Session {
    key: SessionKey,
    link_id: u64,
    link: Option<Arc<dyn MediaLink>>,
    stream: Option<RemoteTrack>,
    phase: SessionPhase,
    last_error: Option<SessionError>,
    control: ControlState,
    health: Option<LinkHealth>,
    /// Inbound signals for the negotiation worker; `None` when no worker runs.
    signals: Option<mpsc::UnboundedSender<SignalPayload>>,
    track_tx: watch::Sender<Option<String>>,
    monitor: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(key: SessionKey, link_id: u64) -> Self {
        let (track_tx, _) = watch::channel(None);
        Self {
            key,
            link_id,
            link: None,
            stream: None,
            phase: SessionPhase::Idle,
            last_error: None,
            control: ControlState::Absent,
            health: None,
            signals: None,
            track_tx,
            monitor: None,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn control(&self) -> ControlState {
        self.control
    }

    pub fn link(&self) -> Option<&Arc<dyn MediaLink>> {
        self.link.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            phase: self.phase,
            stream: self.stream.clone(),
            last_error: self.last_error.clone(),
            control: self.control,
            health: self.health.clone(),
        }
    }

    /// Enter `NEGOTIATING` and start the negotiation worker.
    ///
    /// The worker answers with [`SessionEventKind::Ready`] (hand it to
    /// [`Session::on_link_ready`]) or [`SessionEventKind::Failed`].
    pub fn begin(&mut self, ctx: &NegotiationContext) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Idle {
            return Err(self.negotiation_error(format!("cannot negotiate from {}", self.phase)));
        }
        self.phase = SessionPhase::Negotiating;
        info!("Negotiating session {}", self.key);

        let (signals, queue) = mpsc::unbounded_channel();
        self.signals = Some(signals);
        let worker = Negotiator {
            key: self.key.clone(),
            factory: ctx.factory.clone(),
            ice: ctx.ice.clone(),
            control_label: ctx.control_label.clone(),
            sink: self.sink(ctx),
        };
        tokio::spawn(worker.run(queue));
        Ok(())
    }

    /// Adopt the link built by the worker and start the liveness sampler.
    /// Returns the offer envelope to send.
    pub fn on_link_ready(&mut self, ready: LinkReady, ctx: &NegotiationContext) -> Envelope {
        let LinkReady { link, offer, control } = ready;
        debug!("Link ready for {}", self.key);
        self.control = control;
        self.monitor = Some(monitor::spawn_sampler(
            link.clone(),
            self.track_tx.subscribe(),
            self.sink(ctx),
            ctx.monitor_interval,
            ctx.stall_threshold,
        ));
        self.link = Some(link);
        SignalPayload::Description(offer).into_envelope(&self.key.remote, &self.key.local)
    }

    /// Queue one inbound signal payload for the worker.
    ///
    /// Malformed payloads are logged and dropped; the session stays alive.
    pub fn push_signal(&mut self, data: &str) {
        let payload = match SignalPayload::parse(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Malformed signal from {}: {}", self.key.remote, e);
                return;
            }
        };
        let Some(signals) = &self.signals else {
            warn!("Signal for {} while not negotiating, ignoring", self.key);
            return;
        };
        if signals.send(payload).is_err() {
            debug!("Negotiation worker for {} has stopped", self.key);
        }
    }

    fn sink(&self, ctx: &NegotiationContext) -> LinkEventSink {
        LinkEventSink::new(self.key.remote.clone(), self.link_id, ctx.events.clone())
    }

    /// Record the attached stream and point the sampler at its track.
    pub fn attach_stream(&mut self, track: RemoteTrack) {
        info!("Stream {} attached to {}", track.stream_id, self.key);
        self.track_tx.send_replace(Some(track.track_id.clone()));
        self.stream = Some(track);
    }

    /// Apply a connectivity change. Returns the new phase if it changed.
    pub fn on_link_state(&mut self, state: LinkState) -> Option<SessionPhase> {
        let next = match state {
            LinkState::Connected if self.phase == SessionPhase::Negotiating => SessionPhase::Connected,
            LinkState::Failed => SessionPhase::Failed,
            LinkState::Disconnected => SessionPhase::Disconnected,
            LinkState::Closed => SessionPhase::Closed,
            _ => {
                debug!("Link {} for {}", state, self.key);
                return None;
            }
        };

        if next.is_terminal() {
            let err = SessionError::LinkDegraded {
                peer: self.key.remote.clone(),
                state,
            };
            warn!("{}", err);
            self.last_error = Some(err);
            self.release(next);
        } else {
            info!("Session {} connected", self.key);
            self.phase = next;
        }
        Some(next)
    }

    pub fn set_control(&mut self, state: ControlState) {
        self.control = state;
    }

    pub fn set_health(&mut self, health: LinkHealth) {
        self.health = Some(health);
    }

    /// Move to `FAILED` with the given error and release the link.
    pub fn fail(&mut self, err: SessionError) {
        error!("{}", err);
        self.last_error = Some(err);
        self.release(SessionPhase::Failed);
    }

    /// Release the link, control channel and sampler, entering `phase`.
    pub fn release(&mut self, phase: SessionPhase) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        if self.control != ControlState::Absent {
            self.control = ControlState::Closed;
        }
        self.signals = None;
        self.phase = phase;
    }

    fn negotiation_error(&self, reason: String) -> SessionError {
        SessionError::Negotiation {
            peer: self.key.remote.clone(),
            reason,
        }
    }
}

/// Owns the suspending half of one session's negotiation.
struct Negotiator {
    key: SessionKey,
    factory: Arc<dyn LinkFactory>,
    ice: IceServerSource,
    control_label: Option<String>,
    sink: LinkEventSink,
}

impl Negotiator {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<SignalPayload>) {
        let link = match self.start().await {
            Ok(ready) => {
                let link = ready.link.clone();
                if !self.sink.send(SessionEventKind::Ready(ready)) {
                    link.close();
                    return;
                }
                link
            }
            Err(e) => {
                self.sink.send(SessionEventKind::Failed(e));
                return;
            }
        };

        let mut answered = false;
        let mut early: Vec<IceCandidate> = Vec::new();
        while let Some(payload) = queue.recv().await {
            match payload {
                SignalPayload::Description(desc) => {
                    if desc.sdp_type != SdpType::Answer {
                        warn!("Ignoring {:?} description from {}", desc.sdp_type, self.key.remote);
                        continue;
                    }
                    if answered {
                        debug!("Duplicate answer from {}, ignoring", self.key.remote);
                        continue;
                    }
                    if let Err(e) = link.apply_answer(desc).await {
                        let err = self.negotiation_error(e.to_string());
                        self.sink.send(SessionEventKind::Failed(err));
                        return;
                    }
                    answered = true;
                    debug!("Answer applied for {}", self.key);

                    for candidate in std::mem::take(&mut early) {
                        self.add_candidate(&link, candidate).await;
                    }
                }
                SignalPayload::Candidate(candidate) => {
                    if answered {
                        self.add_candidate(&link, candidate).await;
                    } else {
                        debug!("Queueing early candidate for {}", self.key);
                        early.push(candidate);
                    }
                }
            }
        }
        debug!("Negotiation worker for {} stopped", self.key);
    }

    /// Resolve relays, create the link, request the control channel and
    /// create the offer. A link that fails to offer is closed here.
    async fn start(&self) -> Result<LinkReady, SessionError> {
        let servers = self.ice.resolve().await;
        let link = self
            .factory
            .create_link(servers, self.sink.clone())
            .await
            .map_err(|e| self.negotiation_error(e.to_string()))?;

        let mut control = ControlState::Absent;
        if let Some(label) = &self.control_label {
            match link.open_control_channel(label).await {
                Ok(()) => control = ControlState::Opening,
                Err(e) => warn!("Control channel for {} unavailable: {}", self.key, e),
            }
        }

        match link.create_offer().await {
            Ok(offer) => Ok(LinkReady { link, offer, control }),
            Err(e) => {
                link.close();
                Err(self.negotiation_error(e.to_string()))
            }
        }
    }

    async fn add_candidate(&self, link: &Arc<dyn MediaLink>, candidate: IceCandidate) {
        if let Err(e) = link.add_remote_candidate(candidate).await {
            warn!("Remote candidate rejected for {}: {}", self.key, e);
        }
    }

    fn negotiation_error(&self, reason: String) -> SessionError {
        SessionError::Negotiation {
            peer: self.key.remote.clone(),
            reason,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.link.is_some() || self.monitor.is_some() {
            self.release(SessionPhase::Closed);
        }
    }
}
