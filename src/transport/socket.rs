//! Socket abstractions consumed by the proxy session.
//!
//! # Responsibilities
//! - Describe the inbound (client-facing) and outbound (backend-facing)
//!   WebSocket endpoints the session drives
//! - Classify socket failures into the connect-failure taxonomy
//!
//! # Design Decisions
//! - Socket operations are synchronous and non-blocking; progress is reported
//!   back through the session's event inbox, never by return value
//! - State is shared with the socket's I/O task through an atomic so the
//!   session can query it without awaiting

use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode, Uri};
use bytes::Bytes;
use thiserror::Error;

use crate::session::events::EventSink;
use crate::transport::frame::Frame;

/// Socket lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    /// The peer sent a close frame; we have not closed our side yet.
    PeerClosed = 3,
    /// We initiated (or answered) the close.
    Closing = 4,
    Closed = 5,
}

impl From<u8> for SocketState {
    fn from(val: u8) -> Self {
        match val {
            1 => SocketState::Connecting,
            2 => SocketState::Connected,
            3 => SocketState::PeerClosed,
            4 => SocketState::Closing,
            5 => SocketState::Closed,
            _ => SocketState::Idle,
        }
    }
}

/// Socket state shared between a socket handle and its I/O task.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: SocketState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> SocketState {
        SocketState::from(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: SocketState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `state` unless the socket is already closing or closed.
    pub fn advance(&self, state: SocketState) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match SocketState::from(cur) {
                    SocketState::Closing | SocketState::Closed => None,
                    _ => Some(state as u8),
                }
            });
    }
}

/// An HTTP error response to send instead of upgrading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Rejection {
    /// A rejection with a plain-text body terminated by a newline.
    pub fn with_message(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from(format!("{}\n", message)),
        }
    }

    pub fn bad_gateway(message: &str) -> Self {
        Self::with_message(StatusCode::BAD_GATEWAY, message)
    }
}

/// Socket failure conditions.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// TCP connect to the target failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// TCP connect did not complete in time.
    #[error("connect timed out")]
    ConnectTimeout,

    /// TLS handshake with the target failed.
    #[error("tls handshake failed: {0}")]
    Tls(String),

    /// The target answered the upgrade with a non-101 response.
    #[error("upstream rejected upgrade with {}", .0.status)]
    Rejected(Rejection),

    /// Anything else (protocol errors, resets after connect, ...).
    #[error("{0}")]
    Other(String),
}

impl SocketError {
    /// Whether another target may be tried after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SocketError::Connect(_) | SocketError::ConnectTimeout | SocketError::Tls(_)
        )
    }
}

/// The upstream's successful handshake response.
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub reason: String,
    pub headers: HeaderMap,
}

/// The request captured from an inbound upgrade.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Everything an outbound socket needs to dial a target.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub uri: url::Url,
    pub headers: HeaderMap,
    pub connect_host: String,
    pub connect_port: u16,
    /// Exempt from the private-address policy (trusted target).
    pub ignore_policies: bool,
    /// Skip TLS certificate validation.
    pub ignore_tls_errors: bool,
}

/// Frame-level operations shared by both socket roles.
pub trait FrameSocket: Send {
    fn state(&self) -> SocketState;

    /// Number of frames ready to be read without waiting.
    fn frames_available(&self) -> usize;

    fn read_frame(&mut self) -> Option<Frame>;

    /// Queue a frame; completion is reported with `FramesWritten`.
    fn write_frame(&mut self, frame: Frame);

    /// Start a graceful close. The socket reports `Closed` when done.
    fn close(&mut self);
}

/// The client-facing side of a session.
pub trait InboundSocket: FrameSocket {
    fn request(&self) -> &RequestData;

    fn peer_address(&self) -> Option<IpAddr>;

    /// Complete the upgrade with the given response headers.
    fn respond_success(&mut self, reason: &str, headers: HeaderMap);

    /// Refuse the upgrade with an HTTP response. The socket reports
    /// `Closed` once the response is handed off.
    fn respond_error(&mut self, rejection: Rejection);
}

/// The backend-facing side of a session.
pub trait OutboundSocket: FrameSocket {
    /// Begin connecting; the outcome arrives as `Connected` or `Error`.
    fn start(&mut self, request: ConnectRequest);
}

/// Creates outbound sockets wired to a session's event inbox.
pub trait SocketFactory: Send + Sync {
    fn create_socket(&self, events: EventSink) -> Box<dyn OutboundSocket>;
}
