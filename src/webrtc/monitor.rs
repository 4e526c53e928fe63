//! Liveness monitoring
//!
//! A sampler task polls a link's inbound-video statistics at a fixed cadence
//! and folds each report into a [`LivenessMonitor`], which derives bitrate,
//! frame rate and resolution and raises a "no data" flag when the received
//! byte count stops growing for longer than the stall threshold.

use super::link::{InboundVideoStats, LinkEventSink, MediaLink};
use log::debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Default sampling cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default silence before a session is flagged as stalled.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(5000);

/// Health derived from the most recent sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHealth {
    /// Megabits per second; absent until two samples exist.
    pub bitrate_mbps: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    /// Bytes have not increased for longer than the stall threshold.
    pub no_data: bool,
}

impl LinkHealth {
    /// `WIDTHxHEIGHT`, when both are known.
    pub fn resolution(&self) -> Option<String> {
        match (self.frame_width, self.frame_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }
}

/// Stateful fold over successive statistics samples.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    stall_threshold: Duration,
    previous: Option<(u64, f64)>,
    last_progress: Instant,
    health: LinkHealth,
}

impl LivenessMonitor {
    /// `started` counts as the last moment data arrived.
    pub fn new(stall_threshold: Duration, started: Instant) -> Self {
        Self {
            stall_threshold,
            previous: None,
            last_progress: started,
            health: LinkHealth::default(),
        }
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    /// Fold one sample (or its absence) taken at `now`.
    pub fn observe(&mut self, sample: Option<&InboundVideoStats>, now: Instant) -> LinkHealth {
        if let Some(sample) = sample {
            let bytes = sample.bytes_received;
            let progressed = match self.previous {
                None => bytes > 0,
                Some((previous_bytes, _)) => bytes > previous_bytes,
            };
            if progressed {
                self.last_progress = now;
            }

            if let Some((previous_bytes, previous_ts)) = self.previous {
                let elapsed_ms = sample.timestamp_ms - previous_ts;
                if elapsed_ms > 0.0 {
                    let delta = bytes.saturating_sub(previous_bytes) as f64;
                    self.health.bitrate_mbps = Some(delta * 8.0 / elapsed_ms / 1000.0);
                }
            }
            self.previous = Some((bytes, sample.timestamp_ms));

            self.health.frames_per_second = sample.frames_per_second;
            if sample.frame_width.is_some() && sample.frame_height.is_some() {
                self.health.frame_width = sample.frame_width;
                self.health.frame_height = sample.frame_height;
            }
        }

        self.health.no_data = now.saturating_duration_since(self.last_progress) > self.stall_threshold;
        self.health.clone()
    }
}

/// Pick the report for the attached video track.
pub fn select_sample<'a>(
    reports: &'a [InboundVideoStats],
    track_id: Option<&str>,
) -> Option<&'a InboundVideoStats> {
    let track_id = track_id?;
    reports.iter().find(|report| report.track_id == track_id)
}

/// Spawn the periodic sampler for one session.
///
/// `track` holds the identity of the currently attached video track; reports
/// for any other track are ignored. Every sample is delivered through `sink`
/// as a health event. Abort the returned handle to stop sampling.
pub fn spawn_sampler(
    link: Arc<dyn MediaLink>,
    track: watch::Receiver<Option<String>>,
    sink: LinkEventSink,
    interval: Duration,
    stall_threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = LivenessMonitor::new(stall_threshold, Instant::now());
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first sample
        // lands one interval after start.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reports = match link.inbound_video_stats().await {
                Ok(reports) => reports,
                Err(e) => {
                    debug!("Stats unavailable for {}: {}", sink.peer(), e);
                    Vec::new()
                }
            };
            let track_id = track.borrow().clone();
            let sample = select_sample(&reports, track_id.as_deref());
            let health = monitor.observe(sample, Instant::now());
            if !sink.emit_health(health) {
                break;
            }
        }
    })
}
