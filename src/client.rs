//! Signaling client
//!
//! [`SignalClient`] is a cloneable handle to one event-loop task. The task
//! owns the [`SessionRegistry`] and processes, one at a time, channel
//! events, tagged link callbacks and caller commands. Nothing else touches
//! session state, and the loop itself never waits on the media layer.

use crate::config::Config;
use crate::transport::channel::{self, ChannelEvent, ChannelHandle, ChannelOptions};
use crate::transport::message::{
    Envelope, Payload, RecordRequest, SegmentRequest, UserConfig,
};
use crate::webrtc::data_channel::TiltStep;
use crate::webrtc::link::{LinkFactory, RemoteTrack, SessionEvent};
use crate::webrtc::monitor::LinkHealth;
use crate::webrtc::registry::{send_control, RegistryOptions, SessionRegistry};
use crate::webrtc::session::{SessionPhase, SessionSnapshot};
use crate::webrtc::SessionError;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the event broadcast; slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChannelUp,
    ChannelDown { reason: String },
    /// The channel exhausted its reconnect attempts.
    ChannelGaveUp,
    /// Server response to the init frame or another request.
    Acknowledged { success: bool, message: Option<String> },
    PhaseChanged {
        peer: String,
        phase: SessionPhase,
        error: Option<SessionError>,
    },
    StreamAttached { peer: String, track: RemoteTrack },
    Health { peer: String, health: LinkHealth },
    ControlOpened { peer: String },
    ControlClosed { peer: String },
    ControlMessage { peer: String, text: String },
    /// Non-signal control traffic (recordings, segments, config, refresh).
    Control(Envelope),
}

enum Command {
    RequestSession {
        peer: String,
        reply: oneshot::Sender<Result<SessionSnapshot, SessionError>>,
    },
    CloseSession {
        peer: String,
        reply: oneshot::Sender<()>,
    },
    Session {
        peer: String,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    SendControl {
        peer: String,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the signaling event loop.
#[derive(Clone)]
pub struct SignalClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    channel: Arc<Mutex<Option<ChannelHandle>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SignalClient {
    /// Connect the control channel and start the event loop.
    pub fn start(config: &Config, factory: Arc<dyn LinkFactory>) -> Self {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let handle = channel::spawn(
            ChannelOptions {
                url: config.server.url.clone(),
                token: config.server.token.clone(),
                auth_query_param: config.channel.auth_query_param.clone(),
                reconnect_attempts: config.channel.reconnect_attempts,
                reconnect_interval: config.channel.reconnect_interval(),
            },
            channel_tx,
        );
        let client = Self::with_transport(
            RegistryOptions::from_config(config),
            factory,
            channel_rx,
            handle.sender(),
        );
        *client.channel.lock() = Some(handle);
        client
    }

    /// Start the event loop over an existing transport.
    pub fn with_transport(
        options: RegistryOptions,
        factory: Arc<dyn LinkFactory>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(options, factory, outbound, session_tx, events.clone());

        let task = tokio::spawn(run_event_loop(
            registry,
            channel_events,
            session_rx,
            command_rx,
            events.clone(),
        ));

        Self {
            commands,
            events,
            channel: Arc::new(Mutex::new(None)),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Request (or return the existing) session with a camera.
    pub async fn request_session(&self, peer: &str) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::RequestSession {
            peer: peer.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Close a session. Unknown cameras are a no-op.
    pub async fn close_session(&self, peer: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::CloseSession {
            peer: peer.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Current state of a session.
    pub async fn session(&self, peer: &str) -> Result<Option<SessionSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Session {
            peer: peer.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Send text over a session's auxiliary control channel.
    pub async fn send_control(&self, peer: &str, text: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::SendControl {
            peer: peer.to_string(),
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Step a camera's tilt motor over the control channel.
    pub async fn tilt(&self, peer: &str, step: TiltStep) -> Result<(), SessionError> {
        self.send_control(peer, step.command()).await
    }

    /// Send an envelope on the shared channel; `from` is set to the local identity.
    pub async fn send(&self, envelope: Envelope) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Send { envelope, reply })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Ask a camera for its recorded ranges between two epoch timestamps.
    pub async fn request_records(
        &self,
        peer: &str,
        id: i64,
        start_time: i64,
        end_time: i64,
    ) -> Result<(), SessionError> {
        self.send(addressed(
            peer,
            Payload::RecordRequest(RecordRequest {
                id: Some(id),
                start_time: Some(start_time),
                end_time: Some(end_time),
            }),
        ))
        .await
    }

    /// Ask a camera for one recorded segment.
    pub async fn request_segment(&self, peer: &str, file_name: &str) -> Result<(), SessionError> {
        self.send(addressed(
            peer,
            Payload::SegmentRequest(SegmentRequest {
                file_name: Some(file_name.to_string()),
            }),
        ))
        .await
    }

    /// Push recording configuration to a camera.
    pub async fn push_user_config(&self, peer: &str, config: UserConfig) -> Result<(), SessionError> {
        self.send(addressed(peer, Payload::UserConfig(config))).await
    }

    /// Release every session and stop the loop and the channel.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.dispatch(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.channel.lock().take() {
            handle.shutdown();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn dispatch(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Stopped)
    }
}

fn addressed(peer: &str, payload: Payload) -> Envelope {
    Envelope {
        to: Some(peer.to_string()),
        from: None,
        payload: Some(payload),
    }
}

async fn run_event_loop(
    mut registry: SessionRegistry,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
) {
    debug!("Signaling event loop started");
    loop {
        tokio::select! {
            // Transport first, then link callbacks, then callers.
            biased;

            Some(event) = channel_events.recv() => match event {
                ChannelEvent::Opened => registry.on_channel_open(),
                ChannelEvent::Frame(envelope) => registry.handle_frame(envelope),
                ChannelEvent::Closed { reason } => registry.on_channel_closed(&reason),
                ChannelEvent::GaveUp => {
                    error!("Control channel gave up reconnecting");
                    let _ = events.send(ClientEvent::ChannelGaveUp);
                }
            },
            Some(event) = session_events.recv() => registry.handle_session_event(event),
            command = commands.recv() => match command {
                Some(Command::RequestSession { peer, reply }) => {
                    let _ = reply.send(registry.request_session(&peer));
                }
                Some(Command::CloseSession { peer, reply }) => {
                    registry.close_session(&peer);
                    let _ = reply.send(());
                }
                Some(Command::Session { peer, reply }) => {
                    let _ = reply.send(registry.session(&peer));
                }
                Some(Command::SendControl { peer, text, reply }) => match registry.control_link(&peer) {
                    Ok(link) => {
                        tokio::spawn(async move {
                            let _ = reply.send(send_control(&peer, &link, &text).await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Some(Command::Send { envelope, reply }) => {
                    let _ = reply.send(registry.send_as_self(envelope));
                }
                Some(Command::Shutdown { reply }) => {
                    registry.shutdown();
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
        }
    }
    registry.shutdown();
    info!("Signaling event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::{decode_envelope, encode_envelope};
    use crate::transport::message::Signal;
    use crate::webrtc::ice_servers::IceServerSource;
    use crate::webrtc::link::{InboundVideoStats, LinkEvent, LinkState, TrackKind};
    use crate::webrtc::signaling::signal_data;
    use crate::webrtc::testing::{FakeLinkFactory, LinkCall};
    use tokio::time::{self, Duration};

    struct Rig {
        client: SignalClient,
        factory: Arc<FakeLinkFactory>,
        channel: mpsc::UnboundedSender<ChannelEvent>,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        events: broadcast::Receiver<ClientEvent>,
    }

    fn rig(identity: &str) -> Rig {
        let factory = Arc::new(FakeLinkFactory::default());
        let (channel, channel_rx) = mpsc::unbounded_channel();
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let options = RegistryOptions {
            identity: Some(identity.to_string()),
            token: Some("T".into()),
            init_target: "server".into(),
            ice: IceServerSource::default(),
            control_label: Some("control".into()),
            monitor_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(5),
        };
        let client = SignalClient::with_transport(options, factory.clone(), channel_rx, out_tx);
        let events = client.subscribe();
        Rig {
            client,
            factory,
            channel,
            outbound,
            events,
        }
    }

    impl Rig {
        async fn next_frame(&mut self) -> Envelope {
            let bytes = time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound closed");
            decode_envelope(&bytes).unwrap()
        }

        async fn wait_for<F>(&mut self, mut predicate: F) -> ClientEvent
        where
            F: FnMut(&ClientEvent) -> bool,
        {
            loop {
                let event = time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("event stream closed");
                if predicate(&event) {
                    return event;
                }
            }
        }

        fn inbound(&self, envelope: Envelope) {
            // Round-trip through the codec as the channel would.
            let decoded = decode_envelope(&encode_envelope(&envelope)).unwrap();
            self.channel.send(ChannelEvent::Frame(decoded)).unwrap();
        }
    }

    fn from_camera(camera: &str, data: &str) -> Envelope {
        Envelope::new("v1", camera, Payload::Signal(Signal::new(camera, data)))
    }

    #[tokio::test]
    async fn end_to_end_negotiation_reaches_connected() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        let snapshot = rig.client.request_session("c7").await.unwrap();
        assert_eq!(snapshot.phase, SessionPhase::Negotiating);

        let init = rig.next_frame().await;
        assert_eq!(init.kind(), "init");
        let offer = rig.next_frame().await;
        assert_eq!(offer.to.as_deref(), Some("c7"));
        assert_eq!(offer.from.as_deref(), Some("v1"));
        assert!(signal_data(&offer).unwrap().contains(r#""type":"offer""#));

        rig.inbound(from_camera("c7", r#"{"type":"answer","sdp":"v=0 answer"}"#));
        rig.inbound(from_camera("c7", r#"{"candidate":"candidate:a","sdpMid":"0","sdpMLineIndex":0}"#));
        rig.inbound(from_camera("c7", r#"{"candidate":"candidate:b","sdpMid":"0","sdpMLineIndex":0}"#));

        let link = rig.factory.link(0);
        link.emit(LinkEvent::Track(RemoteTrack {
            track_id: "t1".into(),
            stream_id: "s1".into(),
            kind: TrackKind::Video,
        }));
        rig.wait_for(|e| matches!(e, ClientEvent::StreamAttached { peer, .. } if peer == "c7"))
            .await;
        assert_eq!(
            rig.client.session("c7").await.unwrap().unwrap().phase,
            SessionPhase::Negotiating
        );

        link.emit(LinkEvent::ConnectionState(LinkState::Connected));
        rig.wait_for(|e| {
            matches!(e, ClientEvent::PhaseChanged { peer, phase: SessionPhase::Connected, .. } if peer == "c7")
        })
        .await;

        assert_eq!(
            link.wait_for_calls(5).await,
            vec![
                LinkCall::OpenControl("control".into()),
                LinkCall::CreateOffer,
                LinkCall::ApplyAnswer("v=0 answer".into()),
                LinkCall::AddCandidate("candidate:a".into()),
                LinkCall::AddCandidate("candidate:b".into()),
            ]
        );
        let session = rig.client.session("c7").await.unwrap().unwrap();
        assert_eq!(session.stream.map(|s| s.stream_id), Some("s1".to_string()));

        rig.client.shutdown().await;
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn sessions_survive_channel_drop() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        rig.client.request_session("c7").await.unwrap();
        rig.channel
            .send(ChannelEvent::Closed { reason: "reset".into() })
            .unwrap();
        rig.wait_for(|e| matches!(e, ClientEvent::ChannelDown { .. })).await;

        let session = rig.client.session("c7").await.unwrap().unwrap();
        assert_eq!(session.phase, SessionPhase::Negotiating);
        assert!(!rig.factory.wait_for_link(0).await.is_closed());
    }

    #[tokio::test]
    async fn commands_are_served_while_a_negotiation_is_suspended() {
        let mut rig = rig("v1");
        let gate = rig.factory.hold("c1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        assert_eq!(rig.next_frame().await.kind(), "init");

        let held = rig.client.request_session("c1").await.unwrap();
        assert_eq!(held.phase, SessionPhase::Negotiating);
        rig.client.request_session("c2").await.unwrap();
        let offer = rig.next_frame().await;
        assert_eq!(offer.to.as_deref(), Some("c2"));
        assert!(rig.client.session("c2").await.unwrap().is_some());

        gate.notify_one();
        let offer = rig.next_frame().await;
        assert_eq!(offer.to.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn tilt_goes_over_the_control_channel() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        rig.client.request_session("c7").await.unwrap();
        assert_eq!(rig.next_frame().await.kind(), "init");
        assert_eq!(rig.next_frame().await.kind(), "signal");

        let err = rig.client.tilt("c7", TiltStep::Up).await.unwrap_err();
        assert_eq!(err.code(), "CONTROL_CHANNEL");

        let link = rig.factory.link(0);
        link.emit(LinkEvent::ControlOpen);
        rig.wait_for(|e| matches!(e, ClientEvent::ControlOpened { peer } if peer == "c7"))
            .await;
        rig.client.tilt("c7", TiltStep::Up).await.unwrap();
        rig.client.tilt("c7", TiltStep::Down).await.unwrap();
        assert_eq!(
            &link.calls()[2..],
            &[
                LinkCall::SendControl("100".into()),
                LinkCall::SendControl("-100".into())
            ]
        );
    }

    #[tokio::test]
    async fn non_signal_traffic_is_published() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        rig.inbound(Envelope::new(
            "v1",
            "server",
            Payload::Response(crate::transport::message::Response {
                message: Some("welcome".into()),
                success: Some(true),
            }),
        ));
        let ack = rig
            .wait_for(|e| matches!(e, ClientEvent::Acknowledged { .. }))
            .await;
        assert_eq!(
            ack,
            ClientEvent::Acknowledged {
                success: true,
                message: Some("welcome".into())
            }
        );

        rig.inbound(Envelope::new("v1", "c7", Payload::TriggerRefresh));
        let event = rig.wait_for(|e| matches!(e, ClientEvent::Control(_))).await;
        assert!(matches!(event, ClientEvent::Control(env) if env.kind() == "trigger_refresh"));
    }

    #[tokio::test]
    async fn typed_requests_carry_local_identity() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        assert_eq!(rig.next_frame().await.kind(), "init");

        rig.client.request_records("c7", 4_294_967_296, 0, 1_700_000_000_000).await.unwrap();
        let frame = rig.next_frame().await;
        assert_eq!(frame.from.as_deref(), Some("v1"));
        assert_eq!(frame.to.as_deref(), Some("c7"));
        assert_eq!(
            frame.payload,
            Some(Payload::RecordRequest(RecordRequest {
                id: Some(4_294_967_296),
                start_time: Some(0),
                end_time: Some(1_700_000_000_000),
            }))
        );
    }

    #[tokio::test]
    async fn send_while_channel_down_is_rejected() {
        let rig = rig("v1");
        let err = rig
            .client
            .request_segment("c7", "seg1.mp4")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHANNEL_DOWN");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_is_reported() {
        let mut rig = rig("v1");
        rig.channel.send(ChannelEvent::Opened).unwrap();
        rig.client.request_session("c7").await.unwrap();
        let link = rig.factory.wait_for_link(0).await;
        link.emit(LinkEvent::Track(RemoteTrack {
            track_id: "t1".into(),
            stream_id: "s1".into(),
            kind: TrackKind::Video,
        }));
        link.set_stats(vec![InboundVideoStats {
            track_id: "t1".into(),
            timestamp_ms: 0.0,
            bytes_received: 1000,
            frames_per_second: Some(10.0),
            frame_width: None,
            frame_height: None,
        }]);

        // Bytes never increase after the first sample.
        let stalled = rig
            .wait_for(|e| matches!(e, ClientEvent::Health { health, .. } if health.no_data))
            .await;
        assert!(matches!(stalled, ClientEvent::Health { peer, .. } if peer == "c7"));

        link.set_stats(vec![InboundVideoStats {
            track_id: "t1".into(),
            timestamp_ms: 10_000.0,
            bytes_received: 5000,
            frames_per_second: Some(10.0),
            frame_width: None,
            frame_height: None,
        }]);
        rig.wait_for(|e| matches!(e, ClientEvent::Health { health, .. } if !health.no_data))
            .await;
    }

    #[tokio::test]
    async fn request_without_identity_fails() {
        let factory = Arc::new(FakeLinkFactory::default());
        let (_channel, channel_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut options = RegistryOptions::from_config(&Config::default());
        options.identity = None;
        let client = SignalClient::with_transport(options, factory, channel_rx, out_tx);
        assert_eq!(
            client.request_session("c7").await.unwrap_err(),
            SessionError::Unauthenticated
        );
        client.shutdown().await;
        assert_eq!(
            client.request_session("c7").await.unwrap_err(),
            SessionError::Stopped
        );
    }
}
