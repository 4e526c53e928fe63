//! Session Registry
//!
//! Multiplexes every camera session over the one shared control channel:
//! - Idempotent session requests keyed by exact camera identity
//! - Pending set for requests made while the channel is down
//! - Routing of inbound signals to their session
//! - Tagged link callbacks and worker results, discarded when their session
//!   is gone or replaced
//! - Release of every media handle on close and teardown
//!
//! No method here suspends. Media-layer work runs on each session's
//! negotiation worker or, for control-channel sends, on a spawned task.

use super::data_channel::ControlState;
use super::ice_servers::IceServerSource;
use super::link::{LinkEvent, LinkFactory, MediaLink, SessionEvent, SessionEventKind, TrackKind};
use super::session::{NegotiationContext, Session, SessionKey, SessionPhase, SessionSnapshot};
use super::signaling::{signal_data, SignalPayload};
use super::SessionError;
use crate::client::ClientEvent;
use crate::config::Config;
use crate::transport::codec::encode_envelope;
use crate::transport::message::{Envelope, Init, Payload};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Local viewer identity; required to request sessions.
    pub identity: Option<String>,
    pub token: Option<String>,
    pub init_target: String,
    pub ice: IceServerSource,
    pub control_label: Option<String>,
    pub monitor_interval: Duration,
    pub stall_threshold: Duration,
}

impl RegistryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.server.identity.clone(),
            token: config.server.token.clone(),
            init_target: config.server.init_target.clone(),
            ice: IceServerSource {
                static_servers: config.webrtc.ice_servers.clone(),
                relay_credentials_url: config.webrtc.relay_credentials_url.clone(),
                token: config.server.token.clone(),
            },
            control_label: config
                .webrtc
                .control_channel
                .then(|| config.webrtc.control_channel_label.clone()),
            monitor_interval: config.monitor.interval(),
            stall_threshold: config.monitor.stall_threshold(),
        }
    }
}

/// Owner of all sessions and the outbound side of the channel.
pub struct SessionRegistry {
    identity: Option<String>,
    token: Option<String>,
    init_target: String,
    ctx: NegotiationContext,
    sessions: HashMap<String, Session>,
    pending: Vec<String>,
    channel_open: bool,
    next_link_id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    notify: broadcast::Sender<ClientEvent>,
}

impl SessionRegistry {
    pub fn new(
        options: RegistryOptions,
        factory: Arc<dyn LinkFactory>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        session_events: mpsc::UnboundedSender<SessionEvent>,
        notify: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity: options.identity,
            token: options.token,
            init_target: options.init_target,
            ctx: NegotiationContext {
                factory,
                ice: options.ice,
                events: session_events,
                control_label: options.control_label,
                monitor_interval: options.monitor_interval,
                stall_threshold: options.stall_threshold,
            },
            sessions: HashMap::new(),
            pending: Vec::new(),
            channel_open: false,
            next_link_id: 1,
            outbound,
            notify,
        }
    }

    pub fn session(&self, peer: &str) -> Option<SessionSnapshot> {
        self.sessions.get(peer).map(Session::snapshot)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Request a session with `peer`.
    ///
    /// A live session is returned unchanged. A terminal one is replaced.
    /// Negotiation starts now if the channel is open, otherwise on open.
    pub fn request_session(&mut self, peer: &str) -> Result<SessionSnapshot, SessionError> {
        let local = self.identity.clone().ok_or(SessionError::Unauthenticated)?;

        if let Some(existing) = self.sessions.get(peer) {
            if !existing.phase().is_terminal() {
                debug!("Session {} already {}", existing.key(), existing.phase());
                return Ok(existing.snapshot());
            }
            debug!("Replacing terminal session {}", existing.key());
            self.sessions.remove(peer);
        }

        let key = SessionKey {
            remote: peer.to_string(),
            local,
        };
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        self.sessions.insert(peer.to_string(), Session::new(key, link_id));
        self.publish_phase(peer);

        if self.channel_open {
            self.negotiate(peer);
        } else if !self.pending.iter().any(|p| p == peer) {
            debug!("Channel not open, deferring negotiation with {}", peer);
            self.pending.push(peer.to_string());
        }

        self.sessions
            .get(peer)
            .map(Session::snapshot)
            .ok_or_else(|| SessionError::SessionNotFound(peer.to_string()))
    }

    /// Close and forget the session with `peer`. Absent peers are a no-op.
    pub fn close_session(&mut self, peer: &str) {
        self.pending.retain(|p| p != peer);
        let Some(mut session) = self.sessions.remove(peer) else {
            return;
        };
        info!("Closing session {}", session.key());
        session.release(SessionPhase::Closed);
        self.emit(ClientEvent::PhaseChanged {
            peer: peer.to_string(),
            phase: SessionPhase::Closed,
            error: None,
        });
    }

    /// The channel came up: identify, then negotiate every pending peer once.
    pub fn on_channel_open(&mut self) {
        self.channel_open = true;
        self.emit(ClientEvent::ChannelUp);
        self.send_init();

        let pending = std::mem::take(&mut self.pending);
        for peer in pending {
            let idle = self
                .sessions
                .get(&peer)
                .is_some_and(|s| s.phase() == SessionPhase::Idle);
            if idle {
                self.negotiate(&peer);
            }
        }
    }

    /// The channel dropped. Sessions are left as they are.
    pub fn on_channel_closed(&mut self, reason: &str) {
        self.channel_open = false;
        let err = SessionError::ChannelDown(reason.to_string());
        warn!("{}", err);
        self.emit(ClientEvent::ChannelDown {
            reason: reason.to_string(),
        });
    }

    /// Dispatch one decoded inbound frame.
    pub fn handle_frame(&mut self, envelope: Envelope) {
        if matches!(envelope.payload, Some(Payload::Signal(_))) {
            if let Err(e) = self.route_inbound(&envelope) {
                warn!("{}", e);
            }
            return;
        }

        if let Some(Payload::Response(response)) = &envelope.payload {
            let success = response.success.unwrap_or(false);
            if !success {
                warn!(
                    "Server rejected request: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
            }
            self.emit(ClientEvent::Acknowledged {
                success,
                message: response.message.clone(),
            });
            return;
        }

        debug!(
            "Control frame {} from {:?}",
            envelope.kind(),
            envelope.from.as_deref()
        );
        self.emit(ClientEvent::Control(envelope));
    }

    /// Route a signal to the session whose camera identity equals `from`.
    ///
    /// The payload is queued on the session's negotiation worker. Signals for
    /// a terminal session are dropped.
    pub fn route_inbound(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let from = envelope.from.as_deref();
        let Some(session) = from.and_then(|peer| self.sessions.get_mut(peer)) else {
            return Err(SessionError::RoutingMiss {
                from: from.map(str::to_string),
            });
        };

        if session.phase().is_terminal() {
            debug!("Session {} is {}, dropping signal", session.key(), session.phase());
            return Ok(());
        }

        match signal_data(envelope) {
            Some(data) => session.push_signal(data),
            None => warn!("Signal from {} carries no data", session.key().remote),
        }
        Ok(())
    }

    /// Apply a tagged link callback, health sample or worker result.
    ///
    /// Events for a missing, replaced or terminal session are dropped; a link
    /// delivered for such a session is closed.
    pub fn handle_session_event(&mut self, event: SessionEvent) {
        let SessionEvent { peer, link_id, kind } = event;
        let live = self
            .sessions
            .get(&peer)
            .is_some_and(|s| s.link_id() == link_id && !s.phase().is_terminal());
        if !live {
            debug!("Dropping stale event for {} (link {})", peer, link_id);
            if let SessionEventKind::Ready(ready) = kind {
                ready.link.close();
            }
            return;
        }
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };

        match kind {
            SessionEventKind::Ready(ready) => {
                let offer = session.on_link_ready(ready, &self.ctx);
                if let Err(e) = self.send(&offer) {
                    warn!("Offer for {} not sent: {}", peer, e);
                }
            }
            SessionEventKind::Failed(err) => {
                session.fail(err);
                self.publish_phase(&peer);
            }
            SessionEventKind::Health(health) => {
                session.set_health(health.clone());
                self.emit(ClientEvent::Health { peer, health });
            }
            SessionEventKind::Link(LinkEvent::LocalCandidate(candidate)) => {
                let envelope = SignalPayload::Candidate(candidate)
                    .into_envelope(&session.key().remote, &session.key().local);
                if let Err(e) = self.send(&envelope) {
                    warn!("Local candidate for {} not sent: {}", peer, e);
                }
            }
            SessionEventKind::Link(LinkEvent::Track(track)) => {
                if track.kind != TrackKind::Video {
                    debug!("Ignoring {:?} track from {}", track.kind, peer);
                    return;
                }
                session.attach_stream(track.clone());
                self.emit(ClientEvent::StreamAttached { peer, track });
            }
            SessionEventKind::Link(LinkEvent::ConnectionState(state)) => {
                if session.on_link_state(state).is_some() {
                    self.publish_phase(&peer);
                }
            }
            SessionEventKind::Link(LinkEvent::ControlOpen) => {
                session.set_control(ControlState::Open);
                self.emit(ClientEvent::ControlOpened { peer });
            }
            SessionEventKind::Link(LinkEvent::ControlClose) => {
                session.set_control(ControlState::Closed);
                self.emit(ClientEvent::ControlClosed { peer });
            }
            SessionEventKind::Link(LinkEvent::ControlMessage(text)) => {
                self.emit(ClientEvent::ControlMessage { peer, text });
            }
        }
    }

    /// The link behind a session's open auxiliary control channel.
    pub fn control_link(&self, peer: &str) -> Result<Arc<dyn MediaLink>, SessionError> {
        let session = self
            .sessions
            .get(peer)
            .ok_or_else(|| SessionError::SessionNotFound(peer.to_string()))?;
        if !session.control().is_open() {
            return Err(control_error(peer, format!("channel is {:?}", session.control())));
        }
        session
            .link()
            .cloned()
            .ok_or_else(|| control_error(peer, "no media link".into()))
    }

    /// Encode and send an envelope, stamping `from` with the local identity.
    pub fn send_as_self(&self, mut envelope: Envelope) -> Result<(), SessionError> {
        let identity = self.identity.clone().ok_or(SessionError::Unauthenticated)?;
        envelope.from = Some(identity);
        self.send(&envelope)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if !self.channel_open {
            return Err(SessionError::ChannelDown("channel not open".into()));
        }
        self.outbound
            .send(encode_envelope(envelope))
            .map_err(|_| SessionError::ChannelDown("transport stopped".into()))
    }

    fn send_init(&self) {
        let Some(identity) = self.identity.clone() else {
            warn!("No local identity configured, skipping init");
            return;
        };
        let init = Envelope::new(
            self.init_target.clone(),
            identity.clone(),
            Payload::Init(Init {
                id: Some(identity),
                is_user: Some(true),
                token: self.token.clone(),
            }),
        );
        if let Err(e) = self.send(&init) {
            warn!("Init not sent: {}", e);
        }
    }

    fn negotiate(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if let Err(e) = session.begin(&self.ctx) {
            debug!("Negotiation with {} did not start: {}", peer, e.code());
        }
        self.publish_phase(peer);
    }

    fn publish_phase(&self, peer: &str) {
        if let Some(session) = self.sessions.get(peer) {
            let snapshot = session.snapshot();
            self.emit(ClientEvent::PhaseChanged {
                peer: peer.to_string(),
                phase: snapshot.phase,
                error: snapshot.last_error,
            });
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.notify.send(event);
    }

    /// Release every session.
    pub fn shutdown(&mut self) {
        self.pending.clear();
        for (_, mut session) in self.sessions.drain() {
            session.release(SessionPhase::Closed);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Send text over a control channel obtained from
/// [`SessionRegistry::control_link`].
pub async fn send_control(peer: &str, link: &Arc<dyn MediaLink>, text: &str) -> Result<(), SessionError> {
    link.send_control(text)
        .await
        .map_err(|e| control_error(peer, e.to_string()))
}

fn control_error(peer: &str, reason: String) -> SessionError {
    SessionError::ControlChannel {
        peer: peer.to_string(),
        reason,
    }
}
