//! WebRTC Signaling payloads
//!
//! SDP descriptions and ICE candidates travel as JSON text inside the
//! `signal.data` field of an envelope. The JSON shapes match what a
//! browser peer produces: `{type, sdp}` for descriptions and
//! `{candidate, sdpMid, sdpMLineIndex, usernameFragment}` for candidates.

use crate::transport::message::{Envelope, Payload, Signal};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// A classified signal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// Classify a JSON payload by shape: an object with a `candidate`
    /// property is a candidate, any other object is a session description.
    pub fn parse(data: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| format!("Invalid signal payload: {}", e))?;
        let is_candidate = match &value {
            Value::Object(map) => map.contains_key("candidate"),
            _ => return Err("Signal payload is not a JSON object".to_string()),
        };
        if is_candidate {
            serde_json::from_value(value)
                .map(SignalPayload::Candidate)
                .map_err(|e| format!("Invalid ICE candidate: {}", e))
        } else {
            serde_json::from_value(value)
                .map(SignalPayload::Description)
                .map_err(|e| format!("Invalid session description: {}", e))
        }
    }

    pub fn to_json(&self) -> String {
        // Both shapes are plain string/number records; serialization cannot fail.
        let json = match self {
            SignalPayload::Description(desc) => serde_json::to_string(desc),
            SignalPayload::Candidate(candidate) => serde_json::to_string(candidate),
        };
        json.unwrap_or_default()
    }

    /// Wrap this payload in an envelope addressed to `to`.
    pub fn into_envelope(self, to: &str, from: &str) -> Envelope {
        Envelope::new(to, from, Payload::Signal(Signal::new(to, self.to_json())))
    }
}

/// Pull the signal data out of an envelope, if it carries one.
pub fn signal_data(envelope: &Envelope) -> Option<&str> {
    match &envelope.payload {
        Some(Payload::Signal(signal)) => signal.data.as_deref(),
        _ => None,
    }
}
