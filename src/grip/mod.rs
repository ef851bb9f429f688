//! Grip control protocol.
//!
//! # Data Flow
//! ```text
//! backend handshake response
//!     → extension.rs (find `grip` in Sec-WebSocket-Extensions)
//!     → bridge.rs (attach control session, pick message prefix)
//!     → control.rs (side channel boundary)
//!     → hub.rs (in-process registry feeding the broker link)
//! ```

pub mod bridge;
pub mod control;
pub mod extension;
pub mod hub;

pub use bridge::ControlBridge;
pub use control::{ControlManager, ControlSession};
pub use extension::{find_in_headers, Extension, ExtensionError, GRIP_EXTENSION};
pub use hub::ControlHub;
