//! Connection lifecycle: connect, reconnect on drop, teardown.
//!
//! Each connection attempt runs in its own task and reports back through the
//! session's event queue as [`ConnectionEvent`]s tagged with an epoch. The
//! manager bumps the epoch on every new attempt and on teardown, so anything
//! arriving from an older channel (frames, closes, timers) is ignored.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::messages::QueryMessage;

/// Delay between a channel closing and the next connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Outbound half of an open channel: one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
/// Inbound half of an open channel: text frames in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// Transport-level error. Logged and recovered by reconnecting; never
/// surfaced on the query path.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not connected")]
    NotConnected,
    #[error("channel closed")]
    ChannelClosed,
    #[error("{0}")]
    Transport(String),
}

/// Opens channels to the answer service.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), ClientError>>;
}

/// [`Connector`] over `tokio-tungstenite`. Only text frames are passed on;
/// binary, ping and pong frames are dropped here, and the stream ends at the
/// first Close frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), ClientError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (write, read) = ws_stream.split();
            let sink = write.with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text))));
            // A Close frame ends the channel even if the peer keeps the socket open.
            let stream = read
                .take_while(|item| future::ready(!matches!(item, Ok(Message::Close(_)))))
                .filter_map(|item| {
                    future::ready(match item {
                        Ok(Message::Text(text)) => Some(Ok(text)),
                        Ok(_) => None,
                        Err(e) => Some(Err(ClientError::from(e))),
                    })
                });
            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Reports from channel tasks and timers back to the owning session.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened { epoch: u64 },
    Frame { epoch: u64, text: String },
    Closed { epoch: u64, error: Option<String> },
    ReconnectDue { epoch: u64 },
}

/// Owns the channel handle for one session.
///
/// `E` is the session's event type; the manager only needs to be able to
/// post [`ConnectionEvent`]s into it.
pub struct ConnectionManager<E> {
    url: String,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<E>,
    state: ConnectionState,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    channel_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl<E> ConnectionManager<E>
where
    E: From<ConnectionEvent> + Send + 'static,
{
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, events: mpsc::UnboundedSender<E>) -> Self {
        Self {
            url: url.into(),
            connector,
            events,
            state: ConnectionState::Disconnected,
            epoch: 0,
            outbound: None,
            channel_task: None,
            reconnect_timer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Start a connection attempt. No-op while connecting or connected.
    /// Failures are reported as a close and retried, never returned.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored");
            return;
        }
        self.cancel_reconnect();
        self.epoch += 1;
        let epoch = self.epoch;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        self.state = ConnectionState::Connecting;
        info!(url = %self.url, epoch, "connecting");
        self.channel_task = Some(tokio::spawn(run_channel(
            epoch,
            Arc::clone(&self.connector),
            self.url.clone(),
            self.events.clone(),
            outbound_rx,
        )));
    }

    /// Queue a query on the open channel.
    pub fn send(&self, message: &QueryMessage<'_>) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        let json = message.to_json()?;
        outbound.send(json).map_err(|_| ClientError::ChannelClosed)
    }

    /// Apply one event. Returns the frame text when it came from the live
    /// channel and should be routed; everything else yields `None`.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> Option<String> {
        match event {
            ConnectionEvent::Opened { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Connecting {
                    info!(url = %self.url, epoch, "connected");
                    self.state = ConnectionState::Connected;
                }
                None
            }
            ConnectionEvent::Frame { epoch, text } => {
                if epoch == self.epoch && self.state == ConnectionState::Connected {
                    Some(text)
                } else {
                    debug!(epoch, current = self.epoch, "dropping frame from stale channel");
                    None
                }
            }
            ConnectionEvent::Closed { epoch, error } => {
                self.on_close(epoch, error);
                None
            }
            ConnectionEvent::ReconnectDue { epoch } => {
                if epoch == self.epoch {
                    self.reconnect_timer = None;
                    self.connect();
                }
                None
            }
        }
    }

    /// Close the channel on purpose. The close is not followed by an
    /// automatic reconnect; the caller decides when to `connect` again.
    pub fn teardown(&mut self) {
        self.cancel_reconnect();
        self.epoch += 1;
        if self.state == ConnectionState::Connecting {
            if let Some(task) = self.channel_task.take() {
                task.abort();
            }
        }
        // Dropping the outbound sender makes the channel task close the sink.
        self.outbound = None;
        self.channel_task = None;
        if self.state != ConnectionState::Disconnected {
            info!(url = %self.url, "channel torn down");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn on_close(&mut self, epoch: u64, error: Option<String>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "ignoring close of stale channel");
            return;
        }
        match error {
            Some(error) => warn!(url = %self.url, %error, "channel failed"),
            None => info!(url = %self.url, "channel closed"),
        }
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
        self.channel_task = None;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let epoch = self.epoch;
        let events = self.events.clone();
        debug!(delay = ?RECONNECT_DELAY, "reconnect scheduled");
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let _ = events.send(ConnectionEvent::ReconnectDue { epoch }.into());
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

impl<E> Drop for ConnectionManager<E> {
    fn drop(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

/// One channel's lifetime: connect, pump frames both ways, report the close.
async fn run_channel<E>(
    epoch: u64,
    connector: Arc<dyn Connector>,
    url: String,
    events: mpsc::UnboundedSender<E>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    E: From<ConnectionEvent> + Send + 'static,
{
    let (mut sink, mut stream) = match connector.connect(&url).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = events.send(
                ConnectionEvent::Closed {
                    epoch,
                    error: Some(e.to_string()),
                }
                .into(),
            );
            return;
        }
    };
    if events.send(ConnectionEvent::Opened { epoch }.into()).is_err() {
        return;
    }

    let error = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        break Some(e.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    if events.send(ConnectionEvent::Frame { epoch, text }.into()).is_err() {
                        break None;
                    }
                }
                Some(Err(e)) => break Some(e.to_string()),
                None => {
                    // Answer the peer's close before letting go of the sink.
                    let _ = sink.close().await;
                    break None;
                }
            },
        }
    };
    let _ = events.send(ConnectionEvent::Closed { epoch, error }.into());
}


#[cfg(test)]
mod tests {
    use super::test_support::MemoryConnector;
    use super::*;
    use tokio::time::Instant;

    type Manager = ConnectionManager<ConnectionEvent>;

    fn manager(connector: &MemoryConnector) -> (Manager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Manager::new("mem://answers", Arc::new(connector.clone()), tx), rx)
    }

    async fn pump(mgr: &mut Manager, rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Option<String> {
        let event = rx.recv().await.expect("event queue closed");
        mgr.handle_event(event)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_send_reaches_peer() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut mgr, mut rx) = manager(&connector);

        mgr.connect();
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert!(matches!(mgr.send(&QueryMessage::new("early")), Err(ClientError::NotConnected)));

        let mut peer = peers.recv().await.unwrap();
        pump(&mut mgr, &mut rx).await;
        assert_eq!(mgr.state(), ConnectionState::Connected);

        mgr.send(&QueryMessage::new("hello")).unwrap();
        assert_eq!(peer.sent.recv().await.unwrap(), r#"{"query":"hello"}"#);

        peer.push("raw frame");
        assert_eq!(pump(&mut mgr, &mut rx).await.as_deref(), Some("raw frame"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (connector, _peers) = MemoryConnector::new();
        let (mut mgr, mut rx) = manager(&connector);
        mgr.connect();
        mgr.connect();
        pump(&mut mgr, &mut rx).await;
        mgr.connect();
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_reconnects_after_fixed_delay() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut mgr, mut rx) = manager(&connector);
        mgr.connect();
        let peer = peers.recv().await.unwrap();
        pump(&mut mgr, &mut rx).await;

        drop(peer);
        pump(&mut mgr, &mut rx).await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let closed_at = Instant::now();

        pump(&mut mgr, &mut rx).await;
        assert!(closed_at.elapsed() >= RECONNECT_DELAY);
        assert_eq!(mgr.state(), ConnectionState::Connecting);

        let _peer = peers.recv().await.unwrap();
        pump(&mut mgr, &mut rx).await;
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_retry_forever_at_fixed_interval() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse(true);
        let (mut mgr, mut rx) = manager(&connector);
        let start = Instant::now();
        mgr.connect();

        // close, timer, close, timer, ..., close: the last close proves the
        // sixth attempt actually ran.
        for _ in 0..11 {
            pump(&mut mgr, &mut rx).await;
        }
        assert_eq!(connector.attempts(), 6);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(start.elapsed() >= RECONNECT_DELAY * 5);
        assert!(start.elapsed() < RECONNECT_DELAY * 6);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_suppresses_reconnect() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut mgr, mut rx) = manager(&connector);
        mgr.connect();
        let mut peer = peers.recv().await.unwrap();
        pump(&mut mgr, &mut rx).await;

        mgr.teardown();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        // The channel task closes the sink and reports a close for the old epoch.
        assert!(peer.sent.recv().await.is_none());
        pump(&mut mgr, &mut rx).await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        tokio::time::sleep(RECONNECT_DELAY * 2).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_from_torn_down_channel_are_dropped() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut mgr, mut rx) = manager(&connector);
        mgr.connect();
        let old = peers.recv().await.unwrap();
        pump(&mut mgr, &mut rx).await;

        old.push(r#"{"type":"content","data":"queued"}"#);
        mgr.teardown();
        mgr.connect();
        assert_eq!(pump(&mut mgr, &mut rx).await, None);
    }
}
