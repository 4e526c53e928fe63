//! camlink - camera viewer signaling core
//!
//! A binary control-message codec, a reconnecting WebSocket control channel,
//! and multiplexed WebRTC viewer sessions with liveness monitoring.

pub mod config;
pub mod transport;
pub mod webrtc;
pub mod client;

// Re-exports
pub use client::{ClientEvent, SignalClient};
pub use config::{Config, ConfigError};
pub use transport::{decode_envelope, encode_envelope, CodecError, Envelope, Payload};
pub use self::webrtc::{LinkHealth, SessionError, SessionPhase, SessionSnapshot, TiltStep};
