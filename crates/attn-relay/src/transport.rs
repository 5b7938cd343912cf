//! Relay transports.
//!
//! A [`Transport`] opens one socket per call and returns a [`TransportHandle`].
//! The handle is the client side: `send`, `close`, `ready_state` and a stream
//! of [`TransportEvent`]s. Every opened socket yields at most one `Open`, any
//! number of `Message`s and exactly one terminal `Close` (possibly preceded by
//! an `Error`). No retry logic lives here.
//!
//! The other end of a handle is a [`TransportPeer`]. [`WsTransport`] drives a
//! peer from a tokio-tungstenite socket; [`ChannelTransport`] hands the peer to
//! the caller so a relay can be scripted in memory.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::TransportError;

/// Close code used when the socket vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(TransportError),
    Close { code: u16, reason: String },
}

/// Frames queued by the client side for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> TransportHandle;
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ReadyState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Client side of one socket.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: SharedState,
}

impl TransportHandle {
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(OutboundFrame::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Start a close. Idempotent once the socket is closing or closed.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => {}
            _ => {
                self.state.set(ReadyState::Closing);
                let _ = self.outbound.send(OutboundFrame::Close { code, reason });
            }
        }
    }

    /// Next event for this socket. A peer that vanished without reporting a
    /// close is surfaced as an abnormal close, so callers always see one.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.state.get() == ReadyState::Closed {
            return self.events.try_recv().ok();
        }
        match self.events.recv().await {
            Some(event) => Some(event),
            None => {
                if self.state.get() == ReadyState::Closed {
                    None
                } else {
                    self.state.set(ReadyState::Closed);
                    Some(TransportEvent::Close {
                        code: CLOSE_ABNORMAL,
                        reason: "transport dropped".to_string(),
                    })
                }
            }
        }
    }
}

/// Socket side of one [`TransportHandle`].
#[derive(Debug)]
pub struct TransportPeer {
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: SharedState,
}

/// Create a connected handle/peer pair in the `Connecting` state.
pub fn channel() -> (TransportHandle, TransportPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let state = SharedState(Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8())));
    (
        TransportHandle {
            outbound: out_tx,
            events: ev_rx,
            state: state.clone(),
        },
        TransportPeer {
            outbound: out_rx,
            events: ev_tx,
            state,
        },
    )
}

impl TransportPeer {
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    pub fn open(&self) {
        if self.state.get() == ReadyState::Connecting {
            self.state.set(ReadyState::Open);
            let _ = self.events.send(TransportEvent::Open);
        }
    }

    pub fn message(&self, text: impl Into<String>) {
        if self.state.get() != ReadyState::Closed {
            let _ = self.events.send(TransportEvent::Message(text.into()));
        }
    }

    pub fn error(&self, err: TransportError) {
        if self.state.get() != ReadyState::Closed {
            let _ = self.events.send(TransportEvent::Error(err));
        }
    }

    /// Report the terminal close. Only the first call has any effect.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.state.get() != ReadyState::Closed {
            // Queue before flipping the state so a reader that sees Closed
            // still finds the event.
            let _ = self.events.send(TransportEvent::Close {
                code,
                reason: reason.into(),
            });
            self.state.set(ReadyState::Closed);
        }
    }

    /// Next frame queued by the client, or `None` once the handle is gone.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Next text frame, skipping close requests.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                OutboundFrame::Text(text) => return Some(text),
                OutboundFrame::Close { .. } => continue,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }
}

/// WebSocket transport over tokio-tungstenite. Must be used inside a tokio
/// runtime; each `open` spawns one I/O task.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(&self, url: &str) -> TransportHandle {
        install_crypto_provider();
        let (handle, peer) = channel();
        tokio::spawn(run_socket(url.to_string(), peer));
        handle
    }
}

/// `wss://` needs a process-wide rustls provider. Ignored when one is
/// already installed.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

async fn run_socket(url: String, mut peer: TransportPeer) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    let stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _response)) => break stream,
                Err(err) => {
                    peer.error(TransportError::WebSocket(err.to_string()));
                    peer.close(CLOSE_ABNORMAL, "connect failed");
                    return;
                }
            },
            frame = peer.recv() => match frame {
                Some(OutboundFrame::Text(_)) => continue,
                Some(OutboundFrame::Close { code, reason }) => {
                    peer.close(code.unwrap_or(CLOSE_NORMAL), reason.unwrap_or_default());
                    return;
                }
                None => {
                    peer.close(CLOSE_ABNORMAL, "closed before open");
                    return;
                }
            },
        }
    };

    debug!(relay_url = %url, "WebSocket open");
    peer.open();
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            frame = peer.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        peer.error(TransportError::WebSocket(err.to_string()));
                        peer.close(CLOSE_ABNORMAL, err.to_string());
                        return;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let code = code.unwrap_or(CLOSE_NORMAL);
                    let reason = reason.unwrap_or_default();
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    peer.close(code, reason);
                    return;
                }
                None => {
                    let _ = sink.close().await;
                    peer.close(CLOSE_NORMAL, "");
                    return;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => peer.message(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((1005, String::new()));
                    peer.close(code, reason);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    peer.error(TransportError::WebSocket(err.to_string()));
                    peer.close(CLOSE_ABNORMAL, err.to_string());
                    return;
                }
                None => {
                    peer.close(CLOSE_ABNORMAL, "stream ended");
                    return;
                }
            },
        }
    }
}

/// In-memory transport: every `open` hands the relay side to the receiver
/// returned by [`ChannelTransport::new`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    peers: mpsc::UnboundedSender<(String, TransportPeer)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, TransportPeer)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn open(&self, url: &str) -> TransportHandle {
        let (handle, peer) = channel();
        // Dropping the peer when nobody listens reads as an abnormal close.
        let _ = self.peers.send((url.to_string(), peer));
        handle
    }
}
