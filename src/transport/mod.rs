//! WebSocket transport layer.
//!
//! # Data Flow
//! ```text
//! client ⇄ downstream.rs (axum upgrade) ⇄ link.rs ⇄ session
//!                                                    ⇅
//! backend ⇄ upstream.rs (tungstenite client) ⇄ link.rs
//! ```
//!
//! # Design Decisions
//! - The session sees only the traits in socket.rs; adapters are swappable
//! - Upgrade headers are per hop and never copied between the two sides

pub mod downstream;
pub mod frame;
pub mod link;
pub mod socket;
pub mod upstream;

use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::HeaderMap;

/// Remove headers that belong to a single hop of the upgrade.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in [
        CONNECTION,
        UPGRADE,
        HOST,
        SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION,
        SEC_WEBSOCKET_ACCEPT,
        CONTENT_LENGTH,
        TRANSFER_ENCODING,
    ] {
        headers.remove(name);
    }
}
