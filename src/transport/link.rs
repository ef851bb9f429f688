//! I/O task behind a connected WebSocket.
//!
//! # Responsibilities
//! - Read messages into a bounded queue and announce them with `ReadyRead`
//! - Write queued frames, acknowledging each with `FramesWritten(1)`
//! - Translate close handshakes and stream errors into socket events
//!
//! # Data Flow
//! ```text
//! socket handle ── Command ──→ writer ──→ sink
//! socket handle ←── Frame ──── reader ←── stream
//!              (bounded; a full queue stops reading)
//! ```
//!
//! # Design Decisions
//! - Generic over the message type so the client-facing (axum) and
//!   backend-facing (tungstenite) sides share one implementation
//! - Close frames are not relayed as frames; they become `PeerClosed`
//! - Ping and pong are relayed like data; the libraries answer pings on
//!   their own as well

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::session::events::{EventSink, SocketEvent};
use crate::transport::frame::Frame;
use crate::transport::socket::{SharedState, SocketError, SocketState};

/// Frames buffered from the peer before reading pauses.
pub const READ_QUEUE_FRAMES: usize = 64;

/// Close code used when we initiate the close.
const NORMAL_CLOSURE: u16 = 1000;

/// What a received message means to the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Frame(Frame),
    Close,
    Ignore,
}

/// A library message type the link can carry.
pub trait WireMessage: Sized + Send + 'static {
    /// Convert an outgoing frame. `None` if it cannot be expressed.
    fn from_frame(frame: Frame) -> Option<Self>;

    /// Classify an incoming message.
    fn into_received(self) -> Received;
}

enum Command {
    Write(Frame),
    Close,
}

/// The socket-side ends of a link.
#[derive(Debug)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
    incoming: mpsc::Receiver<Frame>,
}

/// The task-side ends of a link, consumed by [`LinkTask::run`].
#[derive(Debug)]
pub struct LinkTask {
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::Sender<Frame>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Write(frame) => f.debug_tuple("Write").field(&frame.kind).finish(),
            Command::Close => f.write_str("Close"),
        }
    }
}

/// Create a connected handle/task pair.
pub fn link() -> (LinkHandle, LinkTask) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::channel(READ_QUEUE_FRAMES);
    (
        LinkHandle {
            commands: commands_tx,
            incoming: incoming_rx,
        },
        LinkTask {
            commands: commands_rx,
            incoming: incoming_tx,
        },
    )
}

impl LinkHandle {
    pub fn frames_available(&self) -> usize {
        self.incoming.len()
    }

    pub fn read_frame(&mut self) -> Option<Frame> {
        self.incoming.try_recv().ok()
    }

    pub fn write_frame(&self, frame: Frame) {
        let _ = self.commands.send(Command::Write(frame));
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl LinkTask {
    /// Pump `ws` until the connection ends or the handle is dropped.
    pub async fn run<S, M, E>(self, ws: S, state: SharedState, events: EventSink)
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send,
        M: WireMessage,
        E: Display,
    {
        let LinkTask {
            mut commands,
            incoming,
        } = self;
        let (mut sink, mut stream) = ws.split();

        let reader = async {
            loop {
                let Ok(permit) = incoming.reserve().await else {
                    return;
                };
                match stream.next().await {
                    Some(Ok(message)) => match message.into_received() {
                        Received::Frame(frame) => {
                            permit.send(frame);
                            events.emit(SocketEvent::ReadyRead);
                        }
                        Received::Close => {
                            if state.get() != SocketState::Closing {
                                state.advance(SocketState::PeerClosed);
                                events.emit(SocketEvent::PeerClosed);
                            }
                        }
                        Received::Ignore => {}
                    },
                    Some(Err(e)) => {
                        if state.get() == SocketState::Connected {
                            state.set(SocketState::Closed);
                            events.emit(SocketEvent::Error(SocketError::Other(e.to_string())));
                            return;
                        }
                        tracing::trace!(error = %e, "Read error after close");
                        break;
                    }
                    None => break,
                }
            }
            state.set(SocketState::Closed);
            events.emit(SocketEvent::Closed);
        };

        let writer = async {
            while let Some(command) = commands.recv().await {
                let result = match command {
                    Command::Write(frame) => {
                        let result = match M::from_frame(frame) {
                            Some(message) => sink.send(message).await,
                            None => Ok(()),
                        };
                        events.emit(SocketEvent::FramesWritten(1));
                        result
                    }
                    Command::Close => {
                        let peer_closed = state.get() == SocketState::PeerClosed;
                        state.advance(SocketState::Closing);
                        if peer_closed {
                            // the library already answered the peer's close
                            continue;
                        }
                        match M::from_frame(Frame::close(NORMAL_CLOSURE, "")) {
                            Some(message) => sink.send(message).await,
                            None => Ok(()),
                        }
                    }
                };

                if let Err(e) = result {
                    if state.get() == SocketState::Connected {
                        state.set(SocketState::Closed);
                        events.emit(SocketEvent::Error(SocketError::Other(e.to_string())));
                        return;
                    }
                    tracing::trace!(error = %e, "Write error while closing");
                }
            }
        };

        tokio::select! {
            _ = reader => {}
            _ = writer => {}
        }
    }
}

mod tungstenite_message {
    use bytes::Bytes;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    use super::{Received, WireMessage};
    use crate::transport::frame::{Frame, FrameKind};

    impl WireMessage for Message {
        fn from_frame(frame: Frame) -> Option<Self> {
            match frame.kind {
                FrameKind::Text => String::from_utf8(frame.payload.to_vec())
                    .ok()
                    .map(|text| Message::Text(text.into())),
                FrameKind::Binary => Some(Message::Binary(frame.payload)),
                FrameKind::Ping => Some(Message::Ping(frame.payload)),
                FrameKind::Pong => Some(Message::Pong(frame.payload)),
                FrameKind::Close => Some(Message::Close(frame.close_status().map(
                    |(code, reason)| CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    },
                ))),
                FrameKind::Continuation => None,
            }
        }

        fn into_received(self) -> Received {
            match self {
                Message::Text(text) => {
                    Received::Frame(Frame::text(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Message::Binary(data) => Received::Frame(Frame::binary(data)),
                Message::Ping(data) => Received::Frame(Frame::new(FrameKind::Ping, data, false)),
                Message::Pong(data) => Received::Frame(Frame::new(FrameKind::Pong, data, false)),
                Message::Close(_) => Received::Close,
                Message::Frame(_) => Received::Ignore,
            }
        }
    }
}

mod axum_message {
    use axum::extract::ws::{CloseFrame, Message};
    use bytes::Bytes;

    use super::{Received, WireMessage};
    use crate::transport::frame::{Frame, FrameKind};

    impl WireMessage for Message {
        fn from_frame(frame: Frame) -> Option<Self> {
            match frame.kind {
                FrameKind::Text => String::from_utf8(frame.payload.to_vec())
                    .ok()
                    .map(|text| Message::Text(text.into())),
                FrameKind::Binary => Some(Message::Binary(frame.payload)),
                FrameKind::Ping => Some(Message::Ping(frame.payload)),
                FrameKind::Pong => Some(Message::Pong(frame.payload)),
                FrameKind::Close => Some(Message::Close(frame.close_status().map(
                    |(code, reason)| CloseFrame {
                        code,
                        reason: reason.into(),
                    },
                ))),
                FrameKind::Continuation => None,
            }
        }

        fn into_received(self) -> Received {
            match self {
                Message::Text(text) => {
                    Received::Frame(Frame::text(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Message::Binary(data) => Received::Frame(Frame::binary(data)),
                Message::Ping(data) => Received::Frame(Frame::new(FrameKind::Ping, data, false)),
                Message::Pong(data) => Received::Frame(Frame::new(FrameKind::Pong, data, false)),
                Message::Close(_) => Received::Close,
            }
        }
    }
}
