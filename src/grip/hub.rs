//! In-process control hub.
//!
//! # Responsibilities
//! - Give each control session a unique control id
//! - Publish session presence and grip messages to the broker outbox
//! - Route broker events back to the owning proxy session
//!
//! # Design Decisions
//! - The broker link itself lives outside this crate; it consumes
//!   [`ControlPacket`]s and calls [`ControlHub::deliver`]
//! - Dropping a control session unregisters it and announces `Gone`

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::grip::control::{ControlManager, ControlSession};
use crate::observability::metrics;
use crate::session::events::{ControlEvent, EventSink};

/// What a control session reports to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Here,
    Grip(Bytes),
    Gone,
}

/// One outbound packet for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub cid: Uuid,
    pub kind: PacketKind,
}

/// Registry of live control sessions.
#[derive(Debug, Clone)]
pub struct ControlHub {
    sessions: Arc<DashMap<Uuid, EventSink>>,
    outbox: mpsc::UnboundedSender<ControlPacket>,
}

impl ControlHub {
    /// Create a hub and the receiver the broker link drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlPacket>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: Arc::new(DashMap::new()),
                outbox,
            },
            rx,
        )
    }

    /// Deliver a broker event to the session with control id `cid`.
    /// Returns false if no such session is registered.
    pub fn deliver(&self, cid: &Uuid, event: ControlEvent) -> bool {
        match self.sessions.get(cid) {
            Some(sink) => {
                sink.control(event);
                true
            }
            None => {
                tracing::debug!(cid = %cid, "Control event for unknown session");
                false
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Control ids of all live sessions.
    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}

impl ControlManager for ControlHub {
    fn create_session(&self, events: EventSink) -> Box<dyn ControlSession> {
        Box::new(HubSession {
            cid: Uuid::new_v4(),
            events: Some(events),
            sessions: self.sessions.clone(),
            outbox: self.outbox.clone(),
            started: false,
        })
    }
}

struct HubSession {
    cid: Uuid,
    events: Option<EventSink>,
    sessions: Arc<DashMap<Uuid, EventSink>>,
    outbox: mpsc::UnboundedSender<ControlPacket>,
    started: bool,
}

impl HubSession {
    fn publish(&self, kind: PacketKind) {
        let _ = self.outbox.send(ControlPacket {
            cid: self.cid,
            kind,
        });
    }
}

impl ControlSession for HubSession {
    fn start(&mut self) {
        if let Some(events) = self.events.take() {
            self.sessions.insert(self.cid, events);
            self.started = true;
            self.publish(PacketKind::Here);
            tracing::debug!(cid = %self.cid, "Control session started");
        }
    }

    fn send_grip_message(&mut self, message: Bytes) {
        metrics::record_control_message();
        self.publish(PacketKind::Grip(message));
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        if self.started {
            self.sessions.remove(&self.cid);
            self.publish(PacketKind::Gone);
        }
    }
}
