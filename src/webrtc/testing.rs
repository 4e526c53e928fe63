//! Scripted in-memory media link for tests.

use super::ice_servers::IceServer;
use super::link::{InboundVideoStats, LinkEvent, LinkEventSink, LinkFactory, MediaLink};
use super::signaling::{IceCandidate, SessionDescription};
use super::LinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{self, Duration};

/// One recorded call on a [`FakeLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    CreateOffer,
    ApplyAnswer(String),
    AddCandidate(String),
    OpenControl(String),
    SendControl(String),
}

pub(crate) struct FakeLink {
    sink: LinkEventSink,
    ice_servers: Vec<IceServer>,
    calls: Mutex<Vec<LinkCall>>,
    stats: Mutex<Vec<InboundVideoStats>>,
    fail_offer: bool,
    control_open: AtomicBool,
    closed: AtomicBool,
}

impl FakeLink {
    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub(crate) fn link_id(&self) -> u64 {
        self.sink.link_id()
    }

    /// Fire a callback as the real link would.
    pub(crate) fn emit(&self, event: LinkEvent) {
        if matches!(event, LinkEvent::ControlOpen) {
            self.control_open.store(true, Ordering::SeqCst);
        }
        self.sink.emit(event);
    }

    pub(crate) fn set_stats(&self, stats: Vec<InboundVideoStats>) {
        *self.stats.lock() = stats;
    }

    /// Wait until at least `count` calls were recorded.
    pub(crate) async fn wait_for_calls(&self, count: usize) -> Vec<LinkCall> {
        time::timeout(Duration::from_secs(5), async {
            loop {
                let calls = self.calls();
                if calls.len() >= count {
                    return calls;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for link calls")
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.record(LinkCall::CreateOffer);
        if self.fail_offer {
            return Err(LinkError::Offer("scripted failure".into()));
        }
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{}", self.link_id())))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        self.record(LinkCall::ApplyAnswer(answer.sdp.clone()));
        if answer.sdp.contains("reject") {
            return Err(LinkError::Answer("scripted rejection".into()));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.record(LinkCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn open_control_channel(&self, label: &str) -> Result<(), LinkError> {
        self.record(LinkCall::OpenControl(label.to_string()));
        Ok(())
    }

    async fn send_control(&self, text: &str) -> Result<(), LinkError> {
        if !self.control_open.load(Ordering::SeqCst) {
            return Err(LinkError::DataChannel("not open".into()));
        }
        self.record(LinkCall::SendControl(text.to_string()));
        Ok(())
    }

    async fn inbound_video_stats(&self) -> Result<Vec<InboundVideoStats>, LinkError> {
        Ok(self.stats.lock().clone())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakeLink`]s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLink>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    fail_offer: bool,
}

impl FakeLinkFactory {
    pub(crate) fn failing_offers() -> Self {
        Self {
            fail_offer: true,
            ..Default::default()
        }
    }

    pub(crate) fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock()[index].clone()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Wait until link `index` has been created.
    pub(crate) async fn wait_for_link(&self, index: usize) -> Arc<FakeLink> {
        time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(link) = self.links.lock().get(index).cloned() {
                    return link;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for link creation")
    }

    /// Suspend the next link creation for `peer` until the returned gate is
    /// notified. Later creations for the same peer proceed at once.
    pub(crate) fn hold(&self, peer: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(peer.to_string(), gate.clone());
        gate
    }
}

#[async_trait]
impl LinkFactory for FakeLinkFactory {
    async fn create_link(
        &self,
        ice_servers: Vec<IceServer>,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaLink>, LinkError> {
        let gate = self.gates.lock().remove(sink.peer());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let link = Arc::new(FakeLink {
            sink,
            ice_servers,
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            fail_offer: self.fail_offer,
            control_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}
