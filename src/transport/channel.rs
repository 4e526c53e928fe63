//! Control channel transport
//!
//! Keeps one WebSocket to the signaling server alive, carrying binary
//! [`Envelope`] frames. Connection state changes and decoded frames are
//! reported as [`ChannelEvent`]s; outbound frames go through an unbounded
//! queue. Reconnects use a fixed interval and give up after a bounded number
//! of consecutive failures. Frames queued while disconnected are dropped.

use super::codec::decode_envelope;
use super::message::Envelope;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Events produced by the channel task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Handshake completed; outbound frames will be delivered.
    Opened,
    /// One decoded inbound frame.
    Frame(Envelope),
    /// The socket closed or could not be opened; a reconnect is scheduled.
    Closed { reason: String },
    /// Reconnect attempts exhausted. No further events follow.
    GaveUp,
}

/// Channel connection options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Credential appended as a query parameter.
    pub token: Option<String>,
    /// Name of that query parameter.
    pub auth_query_param: String,
    /// Consecutive failed attempts before giving up.
    pub reconnect_attempts: u32,
    /// Delay between attempts.
    pub reconnect_interval: Duration,
}

/// Handle to a running channel task.
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Sender for encoded outbound frames.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.outbound.clone()
    }

    /// Stop the channel immediately.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Build the connect URL with the credential attached.
pub fn connect_url(options: &ChannelOptions) -> Result<Url, String> {
    let mut url = Url::parse(&options.url).map_err(|e| format!("invalid channel url {}: {}", options.url, e))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(format!("unsupported channel scheme: {}", other)),
    }
    if let Some(token) = &options.token {
        url.query_pairs_mut().append_pair(&options.auth_query_param, token);
    }
    Ok(url)
}

/// Spawn the channel task.
pub fn spawn(options: ChannelOptions, events: mpsc::UnboundedSender<ChannelEvent>) -> ChannelHandle {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(options, events, outbound_rx));
    ChannelHandle { outbound, task }
}

async fn run(
    options: ChannelOptions,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let url = match connect_url(&options) {
        Ok(url) => url,
        Err(e) => {
            warn!("{}", e);
            let _ = events.send(ChannelEvent::Closed { reason: e });
            let _ = events.send(ChannelEvent::GaveUp);
            return;
        }
    };

    let mut failures: u32 = 0;
    loop {
        debug!("Connecting control channel to {}", options.url);
        let reason = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                failures = 0;
                drain_stale(&mut outbound_rx);
                info!("Control channel open: {}", options.url);
                if events.send(ChannelEvent::Opened).is_err() {
                    return;
                }

                let (mut write, mut read) = ws_stream.split();
                loop {
                    tokio::select! {
                        inbound = read.next() => match inbound {
                            Some(Ok(Message::Binary(data))) => match decode_envelope(&data) {
                                Ok(envelope) => {
                                    if events.send(ChannelEvent::Frame(envelope)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("Dropping undecodable frame ({} bytes): {}", data.len(), e),
                            },
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            Some(Ok(Message::Text(text))) => {
                                debug!("Ignoring text frame on control channel ({} bytes)", text.len());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break format!("read error: {}", e),
                            None => break "stream ended".to_string(),
                        },
                        outbound = outbound_rx.recv() => match outbound {
                            Some(frame) => {
                                if let Err(e) = write.send(Message::Binary(frame)).await {
                                    break format!("write error: {}", e);
                                }
                            }
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                failures += 1;
                format!("connect failed: {}", e)
            }
        };

        warn!("Control channel closed: {}", reason);
        if events.send(ChannelEvent::Closed { reason }).is_err() {
            return;
        }

        if failures >= options.reconnect_attempts {
            warn!(
                "Control channel gave up after {} consecutive failures",
                failures
            );
            let _ = events.send(ChannelEvent::GaveUp);
            return;
        }

        time::sleep(options.reconnect_interval).await;
        drain_stale(&mut outbound_rx);
    }
}

/// Drop everything queued while the socket was down.
fn drain_stale(outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut dropped = 0usize;
    while outbound_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Dropped {} frames queued while disconnected", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(url: &str, token: Option<&str>) -> ChannelOptions {
        ChannelOptions {
            url: url.to_string(),
            token: token.map(str::to_string),
            auth_query_param: "auth".to_string(),
            reconnect_attempts: 2,
            reconnect_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn token_is_appended_as_query_parameter() {
        let url = connect_url(&options("wss://signal.example.com/ws", Some("T 1"))).unwrap();
        assert_eq!(url.as_str(), "wss://signal.example.com/ws?auth=T+1");
    }

    #[test]
    fn existing_query_is_preserved() {
        let url = connect_url(&options("ws://localhost:8080/ws?v=2", Some("abc"))).unwrap();
        assert_eq!(url.query(), Some("v=2&auth=abc"));
    }

    #[test]
    fn non_websocket_scheme_is_rejected() {
        assert!(connect_url(&options("http://localhost/ws", None)).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_after_bounded_attempts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Port 9 on loopback refuses connections.
        let _handle = spawn(options("ws://127.0.0.1:9/ws", None), tx);

        let mut closed = 0;
        loop {
            match time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ChannelEvent::Closed { .. })) => closed += 1,
                Ok(Some(ChannelEvent::GaveUp)) => break,
                other => panic!("unexpected channel event: {:?}", other),
            }
        }
        assert_eq!(closed, 2);
    }
}
