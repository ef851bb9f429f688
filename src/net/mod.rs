//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind)
//!     → connection.rs (session slot, session id)
//!     → Hand off to HTTP layer for the upgrade
//!
//! Outbound connection to a target
//!     → tls.rs (verified or unverified TLS for wss targets)
//! ```
//!
//! # Design Decisions
//! - Session slots are bounded; excess upgrades are refused, not queued
//! - Each session tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod tls;
