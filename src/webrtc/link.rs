//! Media link seam
//!
//! The negotiator drives a [`MediaLink`] (one peer connection) and receives
//! its asynchronous callbacks as [`LinkEvent`]s through a [`LinkEventSink`].
//! Each sink is stamped with the owning peer id and a link id, so a callback
//! that fires after its session was closed or replaced can be recognised and
//! discarded. The session's negotiation worker reports through the same sink.

use super::data_channel::ControlState;
use super::ice_servers::IceServer;
use super::monitor::LinkHealth;
use super::signaling::{IceCandidate, SessionDescription};
use super::{LinkError, SessionError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport-level connectivity state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// A remote media track as announced by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identity; stats are matched against it.
    pub track_id: String,
    /// Identity of the stream the track belongs to.
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Callbacks from a media link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A locally gathered connectivity candidate, to be sent to the peer.
    LocalCandidate(IceCandidate),
    /// A remote track arrived.
    Track(RemoteTrack),
    /// Connectivity state changed.
    ConnectionState(LinkState),
    /// Auxiliary control channel opened.
    ControlOpen,
    /// Auxiliary control channel closed.
    ControlClose,
    /// Text received on the auxiliary control channel.
    ControlMessage(String),
}

/// A created link whose local offer has been applied.
pub struct LinkReady {
    pub link: Arc<dyn MediaLink>,
    pub offer: SessionDescription,
    /// `Opening` when the control channel was requested successfully.
    pub control: ControlState,
}

impl fmt::Debug for LinkReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkReady")
            .field("offer", &self.offer)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

/// What a session event carries.
#[derive(Debug)]
pub enum SessionEventKind {
    Link(LinkEvent),
    Health(LinkHealth),
    /// The negotiation worker created the link and the offer.
    Ready(LinkReady),
    /// The negotiation worker gave up; the session must fail.
    Failed(SessionError),
}

/// An event tagged with the session and link that produced it.
#[derive(Debug)]
pub struct SessionEvent {
    pub peer: String,
    pub link_id: u64,
    pub kind: SessionEventKind,
}

/// Where a link delivers its callbacks.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer: String,
    link_id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkEventSink {
    pub fn new(peer: impl Into<String>, link_id: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer: peer.into(),
            link_id,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Deliver a link callback. Returns `false` once the receiver is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.send(SessionEventKind::Link(event))
    }

    /// Deliver a health sample.
    pub fn emit_health(&self, health: LinkHealth) -> bool {
        self.send(SessionEventKind::Health(health))
    }

    pub fn send(&self, kind: SessionEventKind) -> bool {
        self.tx
            .send(SessionEvent {
                peer: self.peer.clone(),
                link_id: self.link_id,
                kind,
            })
            .is_ok()
    }
}

/// One inbound-video statistics report.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundVideoStats {
    /// Identity of the track this report describes.
    pub track_id: String,
    /// Report time in milliseconds.
    pub timestamp_ms: f64,
    pub bytes_received: u64,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

/// One peer media link, as seen by the negotiator.
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Create a recv-only video offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply the remote answer.
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), LinkError>;

    /// Add one remote connectivity candidate.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Open the auxiliary control channel. Open/close arrive as events.
    async fn open_control_channel(&self, label: &str) -> Result<(), LinkError>;

    /// Send text over the auxiliary control channel.
    async fn send_control(&self, text: &str) -> Result<(), LinkError>;

    /// Current inbound-video reports, one per received video track.
    async fn inbound_video_stats(&self) -> Result<Vec<InboundVideoStats>, LinkError>;

    /// Release the link. Must not block; pending operations are abandoned.
    fn close(&self);
}

/// Creates media links.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(
        &self,
        ice_servers: Vec<IceServer>,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaLink>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_tags_events_with_peer_and_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new("c7", 3, tx);
        assert!(sink.emit(LinkEvent::ConnectionState(LinkState::Connected)));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer, "c7");
        assert_eq!(event.link_id, 3);
        assert!(matches!(
            event.kind,
            SessionEventKind::Link(LinkEvent::ConnectionState(LinkState::Connected))
        ));
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new("c7", 1, tx);
        drop(rx);
        assert!(!sink.emit(LinkEvent::ControlOpen));
    }
}
