//! Auxiliary control DataChannel
//!
//! A low-rate text channel opened alongside the media path, used for
//! actuator commands such as tilt steps. Its lifecycle is tracked apart
//! from the negotiation phase.

#[cfg(feature = "webrtc-streaming")]
use super::link::{LinkEvent, LinkEventSink};
#[cfg(feature = "webrtc-streaming")]
use log::debug;
#[cfg(feature = "webrtc-streaming")]
use std::sync::Arc;
#[cfg(feature = "webrtc-streaming")]
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
#[cfg(feature = "webrtc-streaming")]
use ::webrtc::data_channel::RTCDataChannel;

/// Lifecycle of the control channel as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// Not requested for this session.
    #[default]
    Absent,
    /// Created, waiting for the open event.
    Opening,
    Open,
    Closed,
}

impl ControlState {
    pub fn is_open(self) -> bool {
        self == ControlState::Open
    }
}

/// Tilt step commands understood by the camera firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltStep {
    Up,
    Down,
}

impl TiltStep {
    pub fn command(self) -> &'static str {
        match self {
            TiltStep::Up => "100",
            TiltStep::Down => "-100",
        }
    }
}

/// Forward a data channel's open/close/message callbacks to the session.
#[cfg(feature = "webrtc-streaming")]
pub fn wire_control_channel(channel: &Arc<RTCDataChannel>, sink: LinkEventSink) {
    let label = channel.label().to_string();

    let open_sink = sink.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        debug!("Control channel '{}' open for {}", open_label, open_sink.peer());
        open_sink.emit(LinkEvent::ControlOpen);
        Box::pin(async {})
    }));

    let close_sink = sink.clone();
    channel.on_close(Box::new(move || {
        debug!("Control channel '{}' closed for {}", label, close_sink.peer());
        close_sink.emit(LinkEvent::ControlClose);
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        sink.emit(LinkEvent::ControlMessage(text));
        Box::pin(async {})
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilt_commands() {
        assert_eq!(TiltStep::Up.command(), "100");
        assert_eq!(TiltStep::Down.command(), "-100");
    }

    #[test]
    fn only_open_is_open() {
        assert!(ControlState::Open.is_open());
        assert!(!ControlState::Opening.is_open());
        assert!(!ControlState::default().is_open());
    }
}
