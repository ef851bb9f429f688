//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, tracing layer)
//!     → websocket.rs (upgrade check, session slot, session start)
//!     → [session resolves route and connects to a target]
//!     → 101 Switching Protocols, or the session's error response
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, HttpServer};
