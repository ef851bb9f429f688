//! Grip attachment for a connected session.
//!
//! # Responsibilities
//! - Pick the message prefix from the negotiated extension
//! - Own the session's control session and forward control messages to it
//! - Issue the forced subscription for targets that name a channel

use bytes::Bytes;
use serde::Serialize;

use crate::grip::control::{ControlManager, ControlSession};
use crate::grip::extension::Extension;
use crate::session::events::EventSink;

/// Marker for backend text frames addressed to the control channel.
pub const CONTROL_PREFIX: &[u8] = b"c:";

/// Message prefix used when the backend does not declare one.
pub const DEFAULT_MESSAGE_PREFIX: &[u8] = b"m:";

const MESSAGE_PREFIX_PARAM: &str = "message-prefix";

#[derive(Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'a str,
}

/// Message prefix for a (possibly absent) grip extension.
pub fn message_prefix_for(grip: Option<&Extension>) -> Bytes {
    grip.and_then(|ext| ext.param(MESSAGE_PREFIX_PARAM))
        .map(Bytes::copy_from_slice)
        .unwrap_or_else(|| Bytes::from_static(DEFAULT_MESSAGE_PREFIX))
}

/// The control channel attached to one proxy session.
pub struct ControlBridge {
    control: Box<dyn ControlSession>,
    message_prefix: Bytes,
}

impl ControlBridge {
    /// Create and start a control session for this proxy session.
    pub fn attach(manager: &dyn ControlManager, events: EventSink, message_prefix: Bytes) -> Self {
        let mut control = manager.create_session(events);
        control.start();
        Self {
            control,
            message_prefix,
        }
    }

    pub fn message_prefix(&self) -> &[u8] {
        &self.message_prefix
    }

    pub fn send_grip_message(&mut self, message: Bytes) {
        self.control.send_grip_message(message);
    }

    /// Ask the broker to subscribe this session to `channel`.
    pub fn subscribe(&mut self, channel: &str) -> Result<(), serde_json::Error> {
        let message = serde_json::to_vec(&SubscribeMessage {
            kind: "subscribe",
            channel,
        })?;
        self.control.send_grip_message(Bytes::from(message));
        Ok(())
    }
}

impl std::fmt::Debug for ControlBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBridge")
            .field("message_prefix", &self.message_prefix)
            .finish()
    }
}
