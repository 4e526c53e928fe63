//! Control-channel message model
//!
//! Every frame on the control channel is one [`Envelope`]: optional routing
//! strings plus at most one typed payload. Absent fields stay `None` (or
//! empty for repeated fields) after decoding.

use serde::{Deserialize, Serialize};

/// Top-level frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Recipient identifier (camera id, or `"server"`).
    pub to: Option<String>,
    /// Sender identifier.
    pub from: Option<String>,
    /// At most one payload; the last one on the wire wins.
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn new(to: impl Into<String>, from: impl Into<String>, payload: Payload) -> Self {
        Self {
            to: Some(to.into()),
            from: Some(from.into()),
            payload: Some(payload),
        }
    }

    /// Short name of the carried payload, for logging.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            None => "empty",
            Some(payload) => payload.kind(),
        }
    }
}

/// The payload variants, one per envelope field number 3..=11.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Signal(Signal),
    Init(Init),
    Response(Response),
    SegmentRequest(SegmentRequest),
    SegmentResponse(SegmentResponse),
    RecordRequest(RecordRequest),
    RecordResponse(RecordResponse),
    UserConfig(UserConfig),
    TriggerRefresh,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Signal(_) => "signal",
            Payload::Init(_) => "init",
            Payload::Response(_) => "response",
            Payload::SegmentRequest(_) => "segment_request",
            Payload::SegmentResponse(_) => "segment_response",
            Payload::RecordRequest(_) => "record_request",
            Payload::RecordResponse(_) => "record_response",
            Payload::UserConfig(_) => "user_config",
            Payload::TriggerRefresh => "trigger_refresh",
        }
    }
}

/// WebRTC negotiation traffic; `data` carries a JSON session description
/// or ICE candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub stream_id: Option<String>,
    pub data: Option<String>,
}

impl Signal {
    pub fn new(stream_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            data: Some(data.into()),
        }
    }
}

/// Identification sent to the server when the channel opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Init {
    pub id: Option<String>,
    pub is_user: Option<bool>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub message: Option<String>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentRequest {
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub data: Option<Vec<u8>>,
    pub file_name: Option<String>,
}

/// Query for recorded ranges between two epoch timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub id: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub id: Option<i64>,
    pub records: Vec<VideoRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoRange {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub file_name: Option<String>,
}

/// Per-camera recording settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub recording_type: Option<RecordingType>,
    pub schedules: Vec<Schedule>,
    pub motion_config: Option<MotionConfig>,
    pub motion_enabled: Option<bool>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    Unspecified,
    Off,
    Continuous,
    ContinuousScheduled,
    Motion,
    /// A value this build does not know; preserved so it re-encodes unchanged.
    Unrecognized(i32),
}

impl RecordingType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => RecordingType::Unspecified,
            1 => RecordingType::Off,
            2 => RecordingType::Continuous,
            3 => RecordingType::ContinuousScheduled,
            4 => RecordingType::Motion,
            other => RecordingType::Unrecognized(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            RecordingType::Unspecified => 0,
            RecordingType::Off => 1,
            RecordingType::Continuous => 2,
            RecordingType::ContinuousScheduled => 3,
            RecordingType::Motion => 4,
            RecordingType::Unrecognized(value) => value,
        }
    }
}

/// A weekly window; times are `HH:MM` strings as the camera firmware sends them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub days_of_week: Vec<i32>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    pub sensitivity: Option<i32>,
    pub pre_record_seconds: Option<i32>,
    pub post_record_seconds: Option<i32>,
}
