//! Backpressure-bounded frame relay.
//!
//! # Responsibilities
//! - Count unacknowledged writes per destination and stop reading the
//!   source when the destination is full
//! - Decide, per frame, whether backend traffic reaches the client
//! - Keep fragmented messages whole: continuations share the fate of the
//!   frame that opened their message
//!
//! # Data Flow
//! ```text
//! source.read_frame() → route(frame) → dest.write_frame() → pending += 1
//! dest FramesWritten(n)                                    → pending -= n
//! ```

use bytes::Bytes;

use crate::grip::bridge::CONTROL_PREFIX;
use crate::transport::frame::{Frame, FrameKind};
use crate::transport::socket::FrameSocket;

/// Default cap on unacknowledged frames per direction.
pub const PENDING_FRAMES_MAX: usize = 100;

/// Unacknowledged frame writes towards one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCounter {
    pending: usize,
    max: usize,
}

impl PendingCounter {
    pub fn new(max: usize) -> Self {
        Self { pending: 0, max }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn has_capacity(&self) -> bool {
        self.pending < self.max
    }

    pub fn record_write(&mut self) {
        self.pending += 1;
    }

    /// Apply a "N frames written" acknowledgment.
    pub fn acknowledge(&mut self, count: usize) {
        self.pending = self.pending.saturating_sub(count);
    }
}

impl Default for PendingCounter {
    fn default() -> Self {
        Self::new(PENDING_FRAMES_MAX)
    }
}

/// Tracks the message currently being relayed, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageTracker {
    open: Option<FrameKind>,
}

impl MessageTracker {
    /// Type of the admitted message still waiting for its final fragment.
    pub fn open(&self) -> Option<FrameKind> {
        self.open
    }

    pub fn is_idle(&self) -> bool {
        self.open.is_none()
    }
}

/// What to do with a frame read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Forward,
    Suppress,
    /// A control message for the bridge, marker already stripped.
    Control(Bytes),
}

/// Route one backend frame.
///
/// With no `message_prefix` (no bridge attached) all content is forwarded.
/// With a bridge, `c:` text frames go to the control channel and only
/// messages starting with the prefix reach the client.
pub fn route_upstream_frame(
    frame: &Frame,
    tracker: &mut MessageTracker,
    message_prefix: Option<&[u8]>,
) -> Disposition {
    if !frame.kind.is_content() {
        return Disposition::Forward;
    }

    if frame.kind == FrameKind::Continuation {
        if tracker.open.is_none() {
            return Disposition::Suppress;
        }
        if !frame.more {
            tracker.open = None;
        }
        return Disposition::Forward;
    }

    let disposition = match message_prefix {
        None => Disposition::Forward,
        Some(_) if frame.kind == FrameKind::Text && frame.payload.starts_with(CONTROL_PREFIX) => {
            // control messages must fit in one frame
            if frame.more {
                Disposition::Suppress
            } else {
                Disposition::Control(frame.payload.slice(CONTROL_PREFIX.len()..))
            }
        }
        Some(prefix) if frame.payload.starts_with(prefix) => Disposition::Forward,
        Some(_) => Disposition::Suppress,
    };

    tracker.open = if frame.more && disposition == Disposition::Forward {
        Some(frame.kind)
    } else {
        None
    };

    disposition
}

/// Move frames from `source` to `dest` while `dest` has capacity.
///
/// `route` returns the frame to write, or `None` to drop it. Returns the
/// number of frames written.
pub fn pump<S, D, F>(source: &mut S, dest: &mut D, pending: &mut PendingCounter, mut route: F) -> usize
where
    S: FrameSocket + ?Sized,
    D: FrameSocket + ?Sized,
    F: FnMut(Frame) -> Option<Frame>,
{
    let mut written = 0;
    while source.frames_available() > 0 && pending.has_capacity() {
        let Some(frame) = source.read_frame() else {
            break;
        };

        if let Some(frame) = route(frame) {
            dest.write_frame(frame);
            pending.record_write();
            written += 1;
        }
    }
    written
}

/// Read and discard everything `source` has buffered.
pub fn drain<S: FrameSocket + ?Sized>(source: &mut S) -> usize {
    let mut discarded = 0;
    while source.frames_available() > 0 {
        if source.read_frame().is_none() {
            break;
        }
        discarded += 1;
    }
    discarded
}
