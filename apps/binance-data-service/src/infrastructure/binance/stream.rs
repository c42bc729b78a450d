//! Combined-Stream WebSocket Client
//!
//! Connects to `wss://fstream.binance.com/stream` and manages stream
//! subscriptions with `SUBSCRIBE`/`UNSUBSCRIBE` commands.
//!
//! The client is split in two:
//!
//! - [`StreamHandle`] implements [`MarketStream`]. Every call only queues a
//!   command on an unbounded channel, so the multiplexer can call it while
//!   holding its lock.
//! - [`StreamClient`] owns the socket and runs on its own task. It is idle
//!   until the first `open`, reconnects with backoff while streams are
//!   wanted, re-subscribes everything after a reconnect, and goes back to
//!   idle on `close`.
//!
//! Text frames are emitted verbatim as [`FeedEvent::Message`]; decoding
//! happens in the dispatcher.

use std::collections::BTreeSet;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, Command};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedError, FeedEvent, MarketStream};
use crate::domain::channel::ChannelKey;
use crate::infrastructure::metrics;

/// Production combined-stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://fstream.binance.com/stream";

// =============================================================================
// Errors and Configuration
// =============================================================================

/// Errors that end one connection.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Command encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Stream client settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Combined-stream endpoint.
    pub url: String,
    /// Backoff between reconnection attempts.
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Open(String),
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Command side of the stream client.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl StreamHandle {
    fn send(&self, control: Control) -> Result<(), FeedError> {
        self.control.send(control).map_err(|_| FeedError::Stopped)
    }
}

impl MarketStream for StreamHandle {
    fn open(&self, channel: &ChannelKey) -> Result<(), FeedError> {
        self.send(Control::Open(channel.as_str().to_owned()))
    }

    fn subscribe(&self, channel: &ChannelKey) -> Result<(), FeedError> {
        self.send(Control::Subscribe(channel.as_str().to_owned()))
    }

    fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), FeedError> {
        self.send(Control::Unsubscribe(channel.as_str().to_owned()))
    }

    fn close(&self) -> Result<(), FeedError> {
        self.send(Control::Close)
    }
}

// =============================================================================
// Client
// =============================================================================

/// What the client does after a connection phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Idle,
    Stop,
}

/// Socket owner. Run it with [`StreamClient::run`].
pub struct StreamClient {
    config: StreamConfig,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    streams: BTreeSet<String>,
    next_id: u64,
}

/// Create a connected handle/client pair.
///
/// The client stops when `cancel` fires or every handle is dropped.
#[must_use]
pub fn stream_client(
    config: StreamConfig,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) -> (StreamHandle, StreamClient) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        StreamHandle {
            control: control_tx,
        },
        StreamClient {
            config,
            control: control_rx,
            events,
            cancel,
            streams: BTreeSet::new(),
            next_id: 0,
        },
    )
}

impl StreamClient {
    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(url = %self.config.url, "Stream client started");

        while self.wait_for_open().await {
            if self.run_connected().await == Next::Stop {
                break;
            }
        }

        tracing::info!("Stream client stopped");
    }

    /// Idle until a stream is wanted. Returns `false` to stop.
    async fn wait_for_open(&mut self) -> bool {
        loop {
            let control = tokio::select! {
                () = self.cancel.cancelled() => return false,
                control = self.control.recv() => control,
            };

            match control {
                None => return false,
                Some(Control::Open(stream) | Control::Subscribe(stream)) => {
                    self.streams.insert(stream);
                    return true;
                }
                Some(Control::Unsubscribe(stream)) => {
                    self.streams.remove(&stream);
                }
                Some(Control::Close) => self.streams.clear(),
            }
        }
    }

    /// Keep a connection up until `close`, cancellation, or retries run out.
    async fn run_connected(&mut self) -> Next {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let result = self.connect_and_run(&mut policy).await;
            self.emit(FeedEvent::Disconnected).await;

            let error = match result {
                Ok(next) => return next,
                Err(e) => e,
            };
            tracing::warn!(error = %error, "Stream connection error");

            let Some(delay) = policy.next_delay() else {
                let msg = format!(
                    "giving up after {} reconnection attempts",
                    policy.attempt_count()
                );
                tracing::error!(streams = self.streams.len(), "{msg}");
                self.emit(FeedEvent::Error(msg)).await;
                return Next::Idle;
            };

            let attempt = policy.attempt_count();
            tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting to stream");
            metrics::record_reconnect();
            self.emit(FeedEvent::Reconnecting { attempt }).await;

            if let Some(next) = self.backoff(delay).await {
                return next;
            }
        }
    }

    /// Sleep before a reconnect while still tracking commands. Returns
    /// `None` to reconnect.
    async fn backoff(&mut self, delay: std::time::Duration) -> Option<Next> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let control = tokio::select! {
                () = self.cancel.cancelled() => return Some(Next::Stop),
                () = &mut sleep => return None,
                control = self.control.recv() => control,
            };

            match control {
                None => return Some(Next::Stop),
                Some(Control::Open(stream) | Control::Subscribe(stream)) => {
                    self.streams.insert(stream);
                }
                Some(Control::Unsubscribe(stream)) => {
                    self.streams.remove(&stream);
                }
                Some(Control::Close) => {
                    self.streams.clear();
                    return Some(Next::Idle);
                }
            }
        }
    }

    async fn connect_and_run(&mut self, policy: &mut ReconnectPolicy) -> Result<Next, StreamError> {
        tracing::info!(url = %self.config.url, "Connecting to stream");

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return Ok(Next::Stop),
            connected = tokio_tungstenite::connect_async(self.config.url.as_str()) => connected,
        };
        let (ws_stream, _response) = connected?;
        let (mut write, mut read) = ws_stream.split();

        policy.reset();
        self.emit(FeedEvent::Connected).await;

        if !self.streams.is_empty() {
            let id = self.next_id();
            let json = Command::subscribe(self.streams.iter().map(String::as_str), id).encode()?;
            write.send(Message::Text(json.into())).await?;
            tracing::info!(streams = self.streams.len(), "Subscribed active streams");
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Next::Stop);
                }
                control = self.control.recv() => match control {
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Next::Stop);
                    }
                    Some(Control::Open(stream) | Control::Subscribe(stream)) => {
                        if self.streams.insert(stream.clone()) {
                            let id = self.next_id();
                            let json = Command::subscribe([stream.as_str()], id).encode()?;
                            write.send(Message::Text(json.into())).await?;
                            tracing::debug!(stream = %stream, id, "SUBSCRIBE sent");
                        }
                    }
                    Some(Control::Unsubscribe(stream)) => {
                        if self.streams.remove(&stream) {
                            let id = self.next_id();
                            let json = Command::unsubscribe([stream.as_str()], id).encode()?;
                            write.send(Message::Text(json.into())).await?;
                            tracing::debug!(stream = %stream, id, "UNSUBSCRIBE sent");
                        }
                    }
                    Some(Control::Close) => {
                        self.streams.clear();
                        let _ = write.send(Message::Close(None)).await;
                        tracing::info!("Stream closed on request");
                        return Ok(Next::Idle);
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(FeedEvent::Message(text.as_str().to_owned())).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Server sent close frame");
                        return Err(StreamError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(StreamError::ConnectionClosed),
                },
            }
        }
    }

    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn emit(&self, event: FeedEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Feed event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    fn key(symbol: &str) -> ChannelKey {
        ChannelKey::kline(symbol, "1m").unwrap()
    }

    fn fast_config(url: String) -> StreamConfig {
        StreamConfig {
            url,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 2,
            },
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for feed event")
            .expect("feed event channel closed")
    }

    #[test]
    fn handle_fails_once_client_is_gone() {
        let (events, _rx) = mpsc::channel(4);
        let (handle, client) = stream_client(StreamConfig::default(), events, CancellationToken::new());
        drop(client);

        assert_eq!(handle.open(&key("btcusdt")), Err(FeedError::Stopped));
        assert_eq!(handle.close(), Err(FeedError::Stopped));
    }

    #[tokio::test]
    async fn idle_client_stops_on_cancel() {
        let (events, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let (_handle, client) = stream_client(StreamConfig::default(), events, cancel.clone());

        let task = tokio::spawn(client.run());
        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscribes_relays_frames_and_unsubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stream", listener.local_addr().unwrap());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let Some(Ok(Message::Text(first))) = ws.next().await else {
                panic!("expected subscribe command");
            };
            seen_tx.send(first.as_str().to_owned()).unwrap();

            ws.send(Message::Text(r#"{"result":null,"id":1}"#.into())).await.unwrap();
            ws.send(Message::Text(
                r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"x":true}}}"#.into(),
            ))
            .await
            .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    seen_tx.send(text.as_str().to_owned()).unwrap();
                }
            }
        });

        let (events, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (handle, client) = stream_client(fast_config(url), events, cancel.clone());
        let task = tokio::spawn(client.run());

        handle.open(&key("btcusdt")).unwrap();

        assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
        let first = seen_rx.recv().await.unwrap();
        assert_eq!(first, r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":1}"#);

        assert_eq!(
            next_event(&mut rx).await,
            FeedEvent::Message(r#"{"result":null,"id":1}"#.into())
        );
        let FeedEvent::Message(kline) = next_event(&mut rx).await else {
            panic!("expected kline frame");
        };
        assert!(kline.contains("btcusdt@kline_1m"));

        handle.unsubscribe(&key("btcusdt")).unwrap();
        let second = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap().unwrap();
        assert!(second.starts_with(r#"{"method":"UNSUBSCRIBE","params":["btcusdt@kline_1m"]"#));

        handle.close().unwrap();
        assert_eq!(next_event(&mut rx).await, FeedEvent::Disconnected);

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stream", listener.local_addr().unwrap());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let server = tokio::spawn(async move {
            // First connection: read the subscribe then drop the socket.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                seen_tx.send(text.as_str().to_owned()).unwrap();
            }
            drop(ws);

            // Second connection: expect the full set again.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                seen_tx.send(text.as_str().to_owned()).unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let (events, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (handle, client) = stream_client(fast_config(url), events, cancel.clone());
        let task = tokio::spawn(client.run());

        handle.open(&key("btcusdt")).unwrap();
        assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
        let _ = seen_rx.recv().await.unwrap();

        assert_eq!(next_event(&mut rx).await, FeedEvent::Disconnected);
        assert_eq!(next_event(&mut rx).await, FeedEvent::Reconnecting { attempt: 1 });
        assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

        let resubscribe = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap().unwrap();
        assert!(resubscribe.contains(r#""params":["btcusdt@kline_1m"]"#));

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Bind then drop so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stream", listener.local_addr().unwrap());
        drop(listener);

        let (events, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (handle, client) = stream_client(fast_config(url), events, cancel.clone());
        let task = tokio::spawn(client.run());

        handle.open(&key("btcusdt")).unwrap();

        let mut reconnects = 0;
        loop {
            match next_event(&mut rx).await {
                FeedEvent::Reconnecting { .. } => reconnects += 1,
                FeedEvent::Error(msg) => {
                    assert!(msg.contains("giving up"));
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(reconnects, 2);

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
