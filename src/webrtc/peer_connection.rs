//! WebRTC PeerConnection media links
//!
//! [`RtcLinkFactory`] builds receive-only peer connections with webrtc-rs:
//! one recvonly video transceiver, no audio and no outbound media. Callbacks
//! are forwarded to the session as [`LinkEvent`]s. Inbound statistics are
//! derived from per-track RTP counters; frame boundaries come from the RTP
//! marker bit, and resolution is not known at this layer.

use super::data_channel::wire_control_channel;
use super::ice_servers::IceServer;
use super::link::{
    InboundVideoStats, LinkEvent, LinkEventSink, LinkFactory, LinkState, MediaLink, RemoteTrack,
    TrackKind,
};
use super::signaling::{IceCandidate, SessionDescription};
use super::LinkError;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::APIBuilder;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use ::webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use ::webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use ::webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// Creates webrtc-rs backed links.
#[derive(Debug, Default, Clone)]
pub struct RtcLinkFactory;

impl RtcLinkFactory {
    pub fn new() -> Self {
        Self
    }

    async fn create_peer_connection(
        &self,
        ice_servers: Vec<IceServer>,
    ) -> Result<Arc<RTCPeerConnection>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| LinkError::Create(format!("Failed to register codecs: {}", e)))?;

        // Interceptors provide NACK/RTCP feedback for the receiver
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| LinkError::Create(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| LinkError::Create(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create_link(
        &self,
        ice_servers: Vec<IceServer>,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaLink>, LinkError> {
        let pc = self.create_peer_connection(ice_servers).await?;

        // Receive video only
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| LinkError::Create(format!("Failed to add video transceiver: {}", e)))?;

        let link = Arc::new(RtcLink {
            pc,
            sink,
            control: Mutex::new(None),
            tracks: Arc::new(Mutex::new(Vec::new())),
            started: Instant::now(),
            closed: AtomicBool::new(false),
        });
        link.register_callbacks();
        Ok(link)
    }
}

/// RTP counters for one inbound video track.
struct TrackCounters {
    track_id: String,
    bytes: AtomicU64,
    frames: AtomicU64,
    /// Frames and time at the previous stats call, for the rate.
    last_rate_sample: Mutex<Option<(u64, Instant)>>,
}

/// One receive-only peer connection.
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    sink: LinkEventSink,
    control: Mutex<Option<Arc<RTCDataChannel>>>,
    tracks: Arc<Mutex<Vec<Arc<TrackCounters>>>>,
    started: Instant,
    closed: AtomicBool,
}

impl RtcLink {
    fn register_callbacks(&self) {
        let sink = self.sink.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for {}", sink.peer());
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                info!("Peer connection state for {}: {}", sink.peer(), state);
                sink.emit(LinkEvent::ConnectionState(state.into()));
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        let tracks = self.tracks.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let tracks = tracks.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = RemoteTrack {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                };
                info!(
                    "Remote {:?} track {} (stream {}) for {}",
                    kind,
                    remote.track_id,
                    remote.stream_id,
                    sink.peer()
                );

                if kind == TrackKind::Video {
                    let counters = Arc::new(TrackCounters {
                        track_id: remote.track_id.clone(),
                        bytes: AtomicU64::new(0),
                        frames: AtomicU64::new(0),
                        last_rate_sample: Mutex::new(None),
                    });
                    tracks.lock().push(counters.clone());
                    tokio::spawn(count_rtp(track, counters));
                }
                sink.emit(LinkEvent::Track(remote));
            })
        }));
    }
}

/// Drain a remote track, counting payload bytes and frame boundaries.
async fn count_rtp(track: Arc<TrackRemote>, counters: Arc<TrackCounters>) {
    while let Ok((packet, _attributes)) = track.read_rtp().await {
        counters
            .bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        if packet.header.marker {
            counters.frames.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("RTP reader for track {} finished", counters.track_id);
}

#[async_trait]
impl MediaLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| LinkError::Offer(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| LinkError::Offer(format!("Failed to set local description: {}", e)))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        let answer =
            RTCSessionDescription::answer(answer.sdp).map_err(|e| LinkError::Answer(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| LinkError::Answer(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| LinkError::Candidate(e.to_string()))
    }

    async fn open_control_channel(&self, label: &str) -> Result<(), LinkError> {
        let channel = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| LinkError::DataChannel(e.to_string()))?;
        wire_control_channel(&channel, self.sink.clone());
        *self.control.lock() = Some(channel);
        Ok(())
    }

    async fn send_control(&self, text: &str) -> Result<(), LinkError> {
        let channel = self
            .control
            .lock()
            .clone()
            .ok_or_else(|| LinkError::DataChannel("no control channel".into()))?;
        channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| LinkError::DataChannel(e.to_string()))
    }

    async fn inbound_video_stats(&self) -> Result<Vec<InboundVideoStats>, LinkError> {
        let now = Instant::now();
        let timestamp_ms = now.duration_since(self.started).as_secs_f64() * 1000.0;
        let tracks = self.tracks.lock().clone();

        let reports = tracks
            .iter()
            .map(|counters| {
                let frames = counters.frames.load(Ordering::Relaxed);
                let mut last = counters.last_rate_sample.lock();
                let frames_per_second = last.and_then(|(previous, at)| {
                    let secs = now.duration_since(at).as_secs_f64();
                    (secs > 0.0).then(|| frames.saturating_sub(previous) as f64 / secs)
                });
                *last = Some((frames, now));

                InboundVideoStats {
                    track_id: counters.track_id.clone(),
                    timestamp_ms,
                    bytes_received: counters.bytes.load(Ordering::Relaxed),
                    frames_per_second,
                    frame_width: None,
                    frame_height: None,
                }
            })
            .collect();
        Ok(reports)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = self.pc.clone();
        let control = self.control.lock().take();
        let peer = self.sink.peer().to_string();
        tokio::spawn(async move {
            if let Some(channel) = control {
                let _ = channel.close().await;
            }
            if let Err(e) = pc.close().await {
                warn!("Failed to close peer connection for {}: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_connection_states_map_to_link_states() {
        assert_eq!(LinkState::from(RTCPeerConnectionState::Connected), LinkState::Connected);
        assert_eq!(LinkState::from(RTCPeerConnectionState::Failed), LinkState::Failed);
        assert_eq!(LinkState::from(RTCPeerConnectionState::Unspecified), LinkState::New);
    }

    #[tokio::test]
    async fn offer_requests_video_only() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = LinkEventSink::new("c7", 1, tx);
        let link = RtcLinkFactory::new().create_link(Vec::new(), sink).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        assert!(!offer.sdp.contains("m=audio"));

        let stats = link.inbound_video_stats().await.unwrap();
        assert!(stats.is_empty());
        link.close();
    }
}
