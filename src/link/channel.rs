use super::wait_for_flag;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the receive task waits for the writer to flush a close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid channel URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Auth token cannot be sent as a header: {0}")]
    InvalidToken(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outbound payload. Structured data is serialized to JSON text on send.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Text(String),
    Json(Value),
}

impl ChannelMessage {
    fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            ChannelMessage::Text(text) => Ok(text),
            ChannelMessage::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for ChannelMessage {
    fn from(text: String) -> Self {
        ChannelMessage::Text(text)
    }
}

impl From<&str> for ChannelMessage {
    fn from(text: &str) -> Self {
        ChannelMessage::Text(text.to_string())
    }
}

impl From<Value> for ChannelMessage {
    fn from(value: Value) -> Self {
        ChannelMessage::Json(value)
    }
}

/// Lifecycle events of a channel.
///
/// All methods run on the channel's receive task, one at a time, in arrival
/// order. A slow handler delays delivery of the next frame.
#[async_trait]
pub trait ChannelEvents: Send + Sync {
    async fn on_open(&self, _channel: &SocketChannel) {}

    async fn on_message(&self, channel: &SocketChannel, text: &str);

    async fn on_close(&self, _channel: &SocketChannel) {}

    async fn on_error(&self, _channel: &SocketChannel, _error: &ChannelError) {}
}

#[derive(Debug)]
struct Inner {
    id: Uuid,
    url: String,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    outbox: mpsc::UnboundedSender<Message>,
    messages_sent: AtomicU64,
}

/// One persistent WebSocket connection to the cloud.
///
/// Cloning is cheap and every clone refers to the same connection. The
/// connection state is written only by the channel itself (its receive task
/// and `close`); everything else observes it.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    inner: Arc<Inner>,
}

impl SocketChannel {
    /// Start connecting to `url` and return immediately.
    ///
    /// The handshake and the receive loop run on a spawned task; callers wait
    /// on `is_connected()` or `wait_settled()` before relying on the channel.
    pub fn open(
        url: &str,
        token: &str,
        connect_timeout: Duration,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Self, ChannelError> {
        let request = build_request(url, token)?;
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                url: url.to_string(),
                state,
                shutdown,
                outbox,
                messages_sent: AtomicU64::new(0),
            }),
        };

        info!(component = "channel", channel_id = %channel.id(), url = %url, "Opening channel");
        tokio::spawn(run_channel(
            channel.clone(),
            request,
            connect_timeout,
            events,
            outbox_rx,
        ));

        Ok(channel)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.messages_sent.load(Ordering::Relaxed)
    }

    /// Queue a message for the writer.
    ///
    /// Returns `false`, after logging, when the channel is not connected or
    /// the message cannot be serialized. Never panics and never errors.
    pub fn send(&self, message: impl Into<ChannelMessage>) -> bool {
        let text = match message.into().into_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    component = "channel",
                    channel_id = %self.id(),
                    "Failed to serialize message: {}",
                    e
                );
                return false;
            }
        };

        if !self.is_connected() {
            debug!(
                component = "channel",
                channel_id = %self.id(),
                "Dropping message, channel not connected"
            );
            return false;
        }

        match self.inner.outbox.send(Message::Text(text.into())) {
            Ok(()) => {
                self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                warn!(
                    component = "channel",
                    channel_id = %self.id(),
                    "Writer already stopped, message dropped"
                );
                false
            }
        }
    }

    /// Stop the receive loop and release the transport. Safe to call repeatedly.
    pub fn close(&self) {
        if self.mark_disconnected() {
            info!(component = "channel", channel_id = %self.id(), "Closing channel");
        }
        self.inner.shutdown.send_replace(true);
    }

    /// Resolve once the channel is disconnected, whatever the cause.
    pub async fn closed(&self) {
        self.wait_for_state(|s| s == ConnectionState::Disconnected)
            .await;
    }

    /// Resolve once the handshake has either succeeded or failed.
    pub async fn wait_settled(&self) -> ConnectionState {
        self.wait_for_state(|s| s != ConnectionState::Connecting)
            .await
    }

    async fn wait_for_state(&self, pred: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if pred(current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    fn mark_connected(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        })
    }

    fn mark_disconnected(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        })
    }
}

/// Build the handshake request carrying `authorization: token <token>`.
pub fn build_request(url: &str, token: &str) -> Result<Request, ChannelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ChannelError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let value = HeaderValue::from_str(&format!("token {}", token))
        .map_err(|e| ChannelError::InvalidToken(e.to_string()))?;
    request.headers_mut().insert("authorization", value);

    Ok(request)
}

async fn fail_before_open(channel: &SocketChannel, events: &dyn ChannelEvents, err: ChannelError) {
    error!(
        component = "channel",
        channel_id = %channel.id(),
        url = %channel.url(),
        "Channel failed to open: {}",
        err
    );
    channel.mark_disconnected();
    events.on_error(channel, &err).await;
    events.on_close(channel).await;
}

async fn run_channel(
    channel: SocketChannel,
    request: Request,
    connect_timeout: Duration,
    events: Arc<dyn ChannelEvents>,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut shutdown_rx = channel.inner.shutdown.subscribe();

    let connect = tokio::time::timeout(connect_timeout, connect_async(request));
    let outcome = tokio::select! {
        _ = wait_for_flag(&mut shutdown_rx) => None,
        result = connect => Some(result),
    };

    let ws_stream = match outcome {
        None => {
            debug!(
                component = "channel",
                channel_id = %channel.id(),
                "Closed before handshake completed"
            );
            channel.mark_disconnected();
            events.on_close(&channel).await;
            return;
        }
        Some(Ok(Ok((ws_stream, _response)))) => ws_stream,
        Some(Ok(Err(e))) => {
            fail_before_open(&channel, events.as_ref(), ChannelError::Handshake(e.to_string()))
                .await;
            return;
        }
        Some(Err(_)) => {
            fail_before_open(&channel, events.as_ref(), ChannelError::Timeout(connect_timeout))
                .await;
            return;
        }
    };

    if !channel.mark_connected() {
        // close() won the race against the handshake
        let mut ws_stream = ws_stream;
        let _ = ws_stream.close(None).await;
        events.on_close(&channel).await;
        return;
    }

    info!(component = "channel", channel_id = %channel.id(), "Channel connected");
    events.on_open(&channel).await;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let writer_channel = channel.clone();
    let mut writer_shutdown = channel.inner.shutdown.subscribe();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_flag(&mut writer_shutdown) => break,
                msg = outbox_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!(
                                component = "channel",
                                channel_id = %writer_channel.id(),
                                "Write failed: {}",
                                e
                            );
                            writer_channel.inner.shutdown.send_replace(true);
                            return;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            biased;
            _ = wait_for_flag(&mut shutdown_rx) => {
                debug!(component = "channel", channel_id = %channel.id(), "Receive loop stopping");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    events.on_message(&channel, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(
                        component = "channel",
                        channel_id = %channel.id(),
                        "Binary frames are not supported"
                    );
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        component = "channel",
                        channel_id = %channel.id(),
                        "Remote closed channel: {:?}",
                        frame
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let err = ChannelError::Transport(e.to_string());
                    error!(
                        component = "channel",
                        channel_id = %channel.id(),
                        "Channel error: {}",
                        err
                    );
                    events.on_error(&channel, &err).await;
                    break;
                }
                None => {
                    info!(
                        component = "channel",
                        channel_id = %channel.id(),
                        "Channel stream ended"
                    );
                    break;
                }
            },
        }
    }

    channel.mark_disconnected();
    channel.inner.shutdown.send_replace(true);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(component = "channel", channel_id = %channel.id(), "Writer did not stop in time");
    }

    info!(
        component = "channel",
        channel_id = %channel.id(),
        messages_sent = channel.messages_sent(),
        "Channel disconnected"
    );
    events.on_close(&channel).await;
}
