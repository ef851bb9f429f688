//! WebSocket frame units relayed by a session.

use bytes::Bytes;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
    Continuation,
    Ping,
    Pong,
    Close,
}

impl FrameKind {
    /// Content frames carry (part of) a message; the rest are control frames.
    pub fn is_content(self) -> bool {
        matches!(self, FrameKind::Text | FrameKind::Binary | FrameKind::Continuation)
    }
}

/// One frame. `more` marks a non-final fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
    pub more: bool,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>, more: bool) -> Self {
        Self {
            kind,
            payload: payload.into(),
            more,
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, payload, false)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload, false)
    }

    /// Build a close frame payload: big-endian status code followed by the reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(FrameKind::Close, payload, false)
    }

    /// Status code and reason of a close frame, if the payload carries one.
    pub fn close_status(&self) -> Option<(u16, String)> {
        if self.kind != FrameKind::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some((code, reason))
    }
}
