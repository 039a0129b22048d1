//! Self-healing WebSocket connection to the signaling relay.
//!
//! A [`SignalingSocket`] owns at most one live socket. Unintentional closes
//! are retried with exponential backoff until `max_reconnect_attempts` is hit;
//! [`SignalingSocket::close`] stops everything for good. Frames are never
//! queued while the link is down: `send` just reports `false`, and callers
//! re-send whatever state they need when `Opened` fires again.

pub mod backoff;
pub mod config;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use callbox_proto::SignalingMessage;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{EventHub, Subscription};
pub use backoff::Backoff;
pub use config::TransportConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed { reason: String },
    Message(String),
    Error { message: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the attempt ceiling was reached and the socket gave up.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Waiting,
    Closed,
    Exhausted,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling socket was closed and will not reopen")]
    Shutdown,
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

pub struct SignalingSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    url: String,
    config: TransportConfig,
    backoff: Backoff,
    events: EventHub<TransportEvent>,
    state: Mutex<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

struct ConnectionState {
    lifecycle: TransportState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    attempts: u32,
    forced_close: bool,
    current_delay: Option<Duration>,
    driver: Option<JoinHandle<()>>,
}

impl SignalingSocket {
    pub fn new(url: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let parsed = Url::parse(url).map_err(|err| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SocketInner {
                url: url.to_string(),
                backoff: config.backoff(),
                config,
                events: EventHub::new(),
                state: Mutex::new(ConnectionState {
                    lifecycle: TransportState::Idle,
                    outbound: None,
                    attempts: 0,
                    forced_close: false,
                    current_delay: None,
                    driver: None,
                }),
                shutdown_tx,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn subscribe(&self) -> Subscription<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Start connecting unless a connection is already open or pending.
    /// Must be called from within a Tokio runtime.
    pub fn open(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        if state.forced_close {
            return Err(TransportError::Shutdown);
        }
        if state.lifecycle == TransportState::Exhausted {
            return Err(TransportError::Exhausted {
                attempts: state.attempts,
            });
        }
        if state
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
        {
            debug!(target = "callbox::transport", url = %self.inner.url, "open ignored; connection already open or pending");
            return Ok(());
        }
        state.lifecycle = TransportState::Connecting;
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        state.driver = Some(tokio::spawn(run_driver(
            Arc::clone(&self.inner),
            shutdown_rx,
        )));
        Ok(())
    }

    pub fn send(&self, message: &SignalingMessage) -> bool {
        match message.encode() {
            Ok(text) => self.send_text(text),
            Err(err) => {
                warn!(target = "callbox::transport", error = %err, "failed to encode signaling message");
                false
            }
        }
    }

    /// Returns `false` unless the socket is fully open.
    pub fn send_text(&self, text: String) -> bool {
        let state = self.inner.state.lock();
        let Some(outbound) = state.outbound.as_ref() else {
            warn!(target = "callbox::transport", "signaling socket not connected, message not sent");
            return false;
        };
        if self.inner.config.log_frames {
            debug!(target = "callbox::transport", frame = %text, "signaling frame sent");
        }
        outbound.send(Message::Text(text)).is_ok()
    }

    /// Drop the current socket but keep reconnecting.
    pub fn refresh(&self) {
        let state = self.inner.state.lock();
        if let Some(outbound) = state.outbound.as_ref() {
            let _ = outbound.send(Message::Close(None));
        }
    }

    /// Intentional shutdown; no reconnection will ever happen afterwards.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.forced_close {
                return;
            }
            state.forced_close = true;
            let running = state
                .driver
                .as_ref()
                .is_some_and(|driver| !driver.is_finished());
            if !running {
                state.lifecycle = TransportState::Closed;
            }
        }
        self.inner.shutdown_tx.send_replace(true);
        info!(target = "callbox::transport", url = %self.inner.url, "signaling socket closed by client");
    }

    pub fn state(&self) -> TransportState {
        self.inner.state.lock().lifecycle
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    pub fn current_delay(&self) -> Option<Duration> {
        self.inner.state.lock().current_delay
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        self.close();
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectionEnd {
    Forced,
    Lost(String),
}

async fn run_driver(inner: Arc<SocketInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        inner.state.lock().lifecycle = TransportState::Connecting;
        let connect = tokio::time::timeout(
            inner.config.connect_timeout(),
            connect_async(inner.url.as_str()),
        );
        let outcome = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => ConnectionEnd::Forced,
            result = connect => match result {
                Ok(Ok((stream, _))) => run_connection(&inner, stream, &mut shutdown).await,
                Ok(Err(err)) => {
                    let message = format!("connect failed: {err}");
                    warn!(target = "callbox::transport", url = %inner.url, error = %err, "signaling connect failed");
                    inner.events.emit(TransportEvent::Error { message: message.clone() });
                    inner.events.emit(TransportEvent::Closed { reason: message.clone() });
                    ConnectionEnd::Lost(message)
                }
                Err(_) => {
                    let message = "connect timed out".to_string();
                    warn!(target = "callbox::transport", url = %inner.url, "signaling connect timed out");
                    inner.events.emit(TransportEvent::Error { message: message.clone() });
                    inner.events.emit(TransportEvent::Closed { reason: message.clone() });
                    ConnectionEnd::Lost(message)
                }
            },
        };

        let reason = match outcome {
            ConnectionEnd::Forced => break,
            ConnectionEnd::Lost(reason) => reason,
        };
        if inner.state.lock().forced_close {
            break;
        }

        let (attempt, delay) = {
            let mut state = inner.state.lock();
            if let Some(max) = inner.config.max_reconnect_attempts {
                if state.attempts >= max {
                    state.lifecycle = TransportState::Exhausted;
                    state.current_delay = None;
                    let attempts = state.attempts;
                    drop(state);
                    error!(target = "callbox::transport", url = %inner.url, attempts, "max reconnect attempts reached");
                    inner.events.emit(TransportEvent::Exhausted { attempts });
                    return;
                }
            }
            let delay = inner.backoff.delay(state.attempts);
            state.attempts += 1;
            state.current_delay = Some(delay);
            state.lifecycle = TransportState::Waiting;
            (state.attempts, delay)
        };
        info!(
            target = "callbox::transport",
            url = %inner.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "reconnecting signaling socket"
        );
        inner
            .events
            .emit(TransportEvent::Reconnecting { attempt, delay });

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut state = inner.state.lock();
    state.lifecycle = TransportState::Closed;
    state.outbound = None;
    state.current_delay = None;
}

async fn run_connection(
    inner: &Arc<SocketInner>,
    stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut ws_write, mut ws_read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut state = inner.state.lock();
        if state.forced_close {
            return ConnectionEnd::Forced;
        }
        state.outbound = Some(outbound_tx);
        state.attempts = 0;
        state.current_delay = None;
        state.lifecycle = TransportState::Open;
    }
    info!(target = "callbox::transport", url = %inner.url, "signaling socket connected");
    inner.events.emit(TransportEvent::Opened);

    let end = loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Cow::Borrowed("Normal closure"),
                };
                let _ = ws_write.send(Message::Close(Some(frame))).await;
                break ConnectionEnd::Forced;
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break ConnectionEnd::Lost("outbound channel closed".into());
                };
                if let Err(err) = ws_write.send(message).await {
                    break ConnectionEnd::Lost(format!("send failed: {err}"));
                }
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    inner.events.emit(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        inner.events.emit(TransportEvent::Message(text));
                    }
                    Err(_) => debug!(target = "callbox::transport", "ignoring non-UTF8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by relay".to_string());
                    break ConnectionEnd::Lost(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target = "callbox::transport", url = %inner.url, error = %err, "signaling socket error");
                    inner.events.emit(TransportEvent::Error { message: err.to_string() });
                    break ConnectionEnd::Lost(err.to_string());
                }
                None => break ConnectionEnd::Lost("stream ended".into()),
            }
        }
    };

    {
        let mut state = inner.state.lock();
        state.outbound = None;
        if state.lifecycle == TransportState::Open {
            state.lifecycle = TransportState::Connecting;
        }
    }
    let reason = match &end {
        ConnectionEnd::Forced => "closed by client".to_string(),
        ConnectionEnd::Lost(reason) => reason.clone(),
    };
    warn!(target = "callbox::transport", url = %inner.url, reason = %reason, "signaling socket closed");
    inner.events.emit(TransportEvent::Closed { reason });
    end
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> TransportConfig {
        TransportConfig {
            reconnect_interval_ms: 10,
            reconnect_decay: 1.0,
            max_reconnect_interval_ms: 50,
            connect_timeout_ms: 1_000,
            ..TransportConfig::default()
        }
    }

    async fn next_event(sub: &mut Subscription<TransportEvent>) -> TransportEvent {
        timeout(WAIT, sub.recv())
            .await
            .expect("event timed out")
            .expect("event stream ended")
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("ws://{addr}")
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            SignalingSocket::new("http://localhost:8080", TransportConfig::default()),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(SignalingSocket::new("not a url", TransportConfig::default()).is_err());
    }

    #[tokio::test]
    async fn send_is_rejected_while_disconnected() {
        let socket = SignalingSocket::new(&refused_url().await, fast_config()).expect("socket");
        assert!(!socket.send(&SignalingMessage::Register { id: "a".into() }));
        assert_eq!(socket.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_reports_once() {
        let socket = SignalingSocket::new(
            &refused_url().await,
            fast_config().with_max_reconnect_attempts(3),
        )
        .expect("socket");
        let mut events = socket.subscribe();
        socket.open().expect("open");

        let mut reconnects = Vec::new();
        loop {
            match next_event(&mut events).await {
                TransportEvent::Reconnecting { attempt, .. } => reconnects.push(attempt),
                TransportEvent::Exhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                TransportEvent::Opened => panic!("refused port accepted a connection"),
                _ => {}
            }
        }
        assert_eq!(reconnects, vec![1, 2, 3]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Some(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    TransportEvent::Reconnecting { .. } | TransportEvent::Exhausted { .. }
                ),
                "unexpected event after exhaustion: {event:?}"
            );
        }
        assert_eq!(socket.state(), TransportState::Exhausted);
        assert!(matches!(
            socket.open(),
            Err(TransportError::Exhausted { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_resets_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            // First connection is dropped right after the handshake.
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            drop(ws);
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let _ = frames_tx.send(text);
                }
            }
        });

        let socket = SignalingSocket::new(&format!("ws://{addr}"), fast_config()).expect("socket");
        let mut events = socket.subscribe();
        socket.open().expect("open");
        socket.open().expect("second open is a no-op");

        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
        loop {
            match next_event(&mut events).await {
                TransportEvent::Reconnecting { attempt, delay } => {
                    assert_eq!(attempt, 1);
                    assert_eq!(delay, Duration::from_millis(10));
                    break;
                }
                TransportEvent::Opened => panic!("reopened without a reconnect event"),
                _ => {}
            }
        }
        loop {
            if next_event(&mut events).await == TransportEvent::Opened {
                break;
            }
        }
        assert_eq!(socket.attempts(), 0);
        assert!(socket.is_open());

        assert!(socket.send(&SignalingMessage::Register { id: "alice".into() }));
        let frame = timeout(WAIT, frames_rx.recv())
            .await
            .expect("frame timed out")
            .expect("server ended");
        assert_eq!(
            SignalingMessage::decode(&frame).expect("decode"),
            SignalingMessage::Register { id: "alice".into() }
        );
    }

    #[tokio::test]
    async fn refresh_cycles_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let socket = SignalingSocket::new(&format!("ws://{addr}"), fast_config()).expect("socket");
        let mut events = socket.subscribe();
        socket.open().expect("open");
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

        socket.refresh();
        let mut saw_reconnect = false;
        loop {
            match next_event(&mut events).await {
                TransportEvent::Reconnecting { attempt, .. } => {
                    assert_eq!(attempt, 1);
                    saw_reconnect = true;
                }
                TransportEvent::Opened => break,
                _ => {}
            }
        }
        assert!(saw_reconnect);
        assert!(socket.is_open());
        socket.close();
    }

    #[tokio::test]
    async fn close_disables_reconnection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let socket = SignalingSocket::new(&format!("ws://{addr}"), fast_config()).expect("socket");
        let mut events = socket.subscribe();
        socket.open().expect("open");
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

        socket.close();
        socket.close();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Closed { .. }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Some(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    TransportEvent::Reconnecting { .. } | TransportEvent::Opened
                ),
                "unexpected event after close: {event:?}"
            );
        }
        assert_eq!(socket.state(), TransportState::Closed);
        assert!(matches!(socket.open(), Err(TransportError::Shutdown)));
        assert!(!socket.send_text("{}".into()));
    }
}
