//! camlink - Main entry point
//!
//! Connects to the signaling server, opens one viewer session per camera
//! given on the command line and logs session events until Ctrl-C.

mod args;

use args::Args;
use camlink::webrtc::RtcLinkFactory;
use camlink::{ClientEvent, SessionPhase, SignalClient};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let config = args.load_config()?;

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CAMLINK_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("camlink v{}", env!("CARGO_PKG_VERSION"));

    info!("Loaded configuration from {:?}", args.config);
    config.validate()?;
    info!("Signaling server: {}", config.server.url);

    if config.server.identity.is_none() {
        warn!("No identity configured; sessions cannot be requested");
    }

    let client = SignalClient::start(&config, Arc::new(RtcLinkFactory::new()));
    let mut events = client.subscribe();

    for camera in &args.cameras {
        match client.request_session(camera).await {
            Ok(snapshot) => info!("Session with {}: {}", camera, snapshot.phase.as_str()),
            Err(e) => error!("Failed to request session with {}: {}", camera, e),
        }
    }

    let show_stats = args.stats;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(ClientEvent::ChannelGaveUp) => {
                    error!("Control channel gave up reconnecting");
                    break;
                }
                Ok(event) => log_event(&event, show_stats),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} client events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.shutdown().await;
    info!("camlink stopped");
    Ok(())
}

fn log_event(event: &ClientEvent, show_stats: bool) {
    match event {
        ClientEvent::ChannelUp => info!("Control channel connected"),
        ClientEvent::ChannelDown { reason } => warn!("Control channel down: {}", reason),
        ClientEvent::ChannelGaveUp => error!("Control channel gave up"),
        ClientEvent::Acknowledged { success, message } => {
            info!("Server response: success={} {}", success, message.as_deref().unwrap_or(""))
        }
        ClientEvent::PhaseChanged { peer, phase, error } => match (phase, error) {
            (SessionPhase::Failed, Some(e)) => error!("Session {} failed: {}", peer, e),
            (_, Some(e)) => warn!("Session {} {}: {}", peer, phase.as_str(), e),
            (_, None) => info!("Session {} {}", peer, phase.as_str()),
        },
        ClientEvent::StreamAttached { peer, track } => {
            info!("Session {} streaming track {} ({:?})", peer, track.track_id, track.kind)
        }
        ClientEvent::Health { peer, health } => {
            if health.no_data {
                warn!("Session {}: no data", peer);
            } else if show_stats {
                info!(
                    "Session {}: {:.2} Mbps, {} fps, {}",
                    peer,
                    health.bitrate_mbps.unwrap_or(0.0),
                    health
                        .frames_per_second
                        .map(|fps| format!("{:.0}", fps))
                        .unwrap_or_else(|| "-".into()),
                    health.resolution().unwrap_or_else(|| "-".into())
                );
            }
        }
        ClientEvent::ControlOpened { peer } => debug!("Control data channel open for {}", peer),
        ClientEvent::ControlClosed { peer } => debug!("Control data channel closed for {}", peer),
        ClientEvent::ControlMessage { peer, text } => info!("Control message from {}: {}", peer, text),
        ClientEvent::Control(envelope) => {
            info!("{} from {}", envelope.kind(), envelope.from.as_deref().unwrap_or("?"))
        }
    }
}
