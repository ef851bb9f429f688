//! Grip-aware WebSocket reverse proxy library.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod session;
pub mod transport;

// Control channel
pub mod grip;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use grip::ControlHub;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use session::{ProxySession, SessionContext, SessionSummary};
