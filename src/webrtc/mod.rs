//! WebRTC session layer
//!
//! This module multiplexes viewer sessions over the shared control channel:
//! - SDP/ICE signal payloads carried inside envelopes
//! - The media-link seam and its webrtc-rs implementation
//! - Per-session negotiation state machine
//! - Session registry and routing
//! - Liveness/stall monitoring
//! - Auxiliary control data channel

pub mod signaling;
pub mod link;
pub mod session;
pub mod registry;
pub mod monitor;
pub mod data_channel;
pub mod ice_servers;

#[cfg(feature = "webrtc-streaming")]
pub mod peer_connection;

#[cfg(test)]
pub(crate) mod testing;

pub use data_channel::TiltStep;
pub use link::{InboundVideoStats, LinkEvent, LinkFactory, LinkState, MediaLink};
pub use monitor::{LinkHealth, LivenessMonitor};
pub use registry::SessionRegistry;
pub use session::{SessionKey, SessionPhase, SessionSnapshot};
pub use signaling::{IceCandidate, SessionDescription, SignalPayload};

#[cfg(feature = "webrtc-streaming")]
pub use peer_connection::RtcLinkFactory;

/// Failures reported by the media layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The link could not be created.
    #[error("link creation failed: {0}")]
    Create(String),
    /// Local offer creation or application failed.
    #[error("offer failed: {0}")]
    Offer(String),
    /// Remote description rejected.
    #[error("answer rejected: {0}")]
    Answer(String),
    /// Remote candidate rejected.
    #[error("candidate rejected: {0}")]
    Candidate(String),
    /// Data channel error.
    #[error("data channel error: {0}")]
    DataChannel(String),
    /// Statistics unavailable.
    #[error("stats unavailable: {0}")]
    Stats(String),
}

/// Session-layer errors.
///
/// Only [`SessionError::Unauthenticated`] and a stopped client reach callers
/// as hard failures; the rest are recovered where they occur and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Inbound signal with no matching session.
    #[error("ROUTING_MISS: no session for {from:?}")]
    RoutingMiss { from: Option<String> },

    /// Offer/answer creation or application failed.
    #[error("NEGOTIATION_ERROR: {peer}: {reason}")]
    Negotiation { peer: String, reason: String },

    /// The media link failed, disconnected or closed.
    #[error("LINK_DEGRADED: {peer} link {state}")]
    LinkDegraded { peer: String, state: LinkState },

    /// The shared channel is not open.
    #[error("CHANNEL_DOWN: {0}")]
    ChannelDown(String),

    /// No local identity to negotiate with.
    #[error("UNAUTHENTICATED: a local identity is required to request sessions")]
    Unauthenticated,

    #[error("SESSION_NOT_FOUND: {0}")]
    SessionNotFound(String),

    /// The auxiliary control channel is missing or not open.
    #[error("CONTROL_CHANNEL: {peer}: {reason}")]
    ControlChannel { peer: String, reason: String },

    /// The client event loop has stopped.
    #[error("CLIENT_STOPPED: client event loop is not running")]
    Stopped,
}

impl SessionError {
    /// Stable error code used in logs and events.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::RoutingMiss { .. } => "ROUTING_MISS",
            SessionError::Negotiation { .. } => "NEGOTIATION_ERROR",
            SessionError::LinkDegraded { .. } => "LINK_DEGRADED",
            SessionError::ChannelDown(_) => "CHANNEL_DOWN",
            SessionError::Unauthenticated => "UNAUTHENTICATED",
            SessionError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SessionError::ControlChannel { .. } => "CONTROL_CHANNEL",
            SessionError::Stopped => "CLIENT_STOPPED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_display_prefix() {
        let errors = [
            SessionError::RoutingMiss { from: Some("c9".into()) },
            SessionError::Negotiation { peer: "c7".into(), reason: "bad sdp".into() },
            SessionError::LinkDegraded { peer: "c7".into(), state: LinkState::Failed },
            SessionError::ChannelDown("closed".into()),
            SessionError::Unauthenticated,
            SessionError::SessionNotFound("c7".into()),
            SessionError::ControlChannel { peer: "c7".into(), reason: "not open".into() },
            SessionError::Stopped,
        ];
        for err in errors {
            assert!(err.to_string().starts_with(err.code()), "{}", err);
        }
    }
}
