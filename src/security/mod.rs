//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound upgrade request:
//!     → headers.rs (decide trust, rewrite X-Forwarded-*, strip Grip-Sig)
//!     → Sent to the target
//! ```
//!
//! # Design Decisions
//! - No trust in client input unless the peer address is trusted
//! - Forwarding headers from untrusted clients are truncated, never extended blindly

pub mod headers;
