//! Control-channel boundary.
//!
//! A control session is the side channel between one proxy session and the
//! broker that manages push delivery. The proxy sends it grip messages; the
//! broker answers with [`ControlEvent`](crate::session::events::ControlEvent)s
//! delivered through the session's [`EventSink`].

use bytes::Bytes;

use crate::session::events::EventSink;

/// One session's link to the broker.
pub trait ControlSession: Send {
    /// Announce the session to the broker.
    fn start(&mut self);

    /// Forward a grip control message (marker already stripped).
    fn send_grip_message(&mut self, message: Bytes);
}

/// Creates control sessions.
pub trait ControlManager: Send + Sync {
    fn create_session(&self, events: EventSink) -> Box<dyn ControlSession>;
}
