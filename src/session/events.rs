//! Events delivered to a session's inbox.
//!
//! Every socket and control-session notification is turned into a typed
//! [`SessionEvent`] and queued on the owning session's channel. The session
//! handles them one at a time, so nothing inside a session needs locking.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::socket::{HandshakeResponse, SocketError};

/// Which object produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Inbound,
    /// Outbound socket, tagged with the connect attempt that created it.
    Outbound(u64),
    Control,
}

/// Notifications from a socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connected(HandshakeResponse),
    ReadyRead,
    FramesWritten(usize),
    PeerClosed,
    Closed,
    Error(SocketError),
}

/// Events pushed by the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Deliver a message straight to the client.
    Send { content_type: String, message: Bytes },
    /// Stop relaying backend traffic for good.
    Detach,
}

/// A single inbox entry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Socket { source: Source, event: SocketEvent },
    Control(ControlEvent),
}

/// Handle given to sockets and control sessions to report events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    source: Source,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>, source: Source) -> Self {
        Self { tx, source }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Report a socket event. Events sent after the session is gone are dropped.
    pub fn emit(&self, event: SocketEvent) {
        let _ = self.tx.send(SessionEvent::Socket {
            source: self.source,
            event,
        });
    }

    /// Report a control-channel event.
    pub fn control(&self, event: ControlEvent) {
        let _ = self.tx.send(SessionEvent::Control(event));
    }
}
