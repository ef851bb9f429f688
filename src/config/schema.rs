//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Root configuration for the WebSocket proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Route definitions mapping requests to backend targets.
    pub routes: Vec<RouteConfig>,

    /// Per-session proxying behavior.
    pub proxy: SessionConfig,

    /// Control channel settings.
    pub control: ControlConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7999").
    pub bind_address: String,

    /// Maximum concurrent sessions (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7999".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Route configuration mapping requests to an ordered target list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Only match wss (`true`) or ws (`false`) connections.
    pub secure: Option<bool>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Prefix applied to channel names for this route.
    #[serde(default)]
    pub channel_prefix: String,

    /// Signing identity for requests on this route.
    pub sig_iss: Option<String>,

    /// Signing key for requests on this route.
    pub sig_key: Option<String>,

    /// Backend targets, tried in order.
    pub targets: Vec<TargetConfig>,
}

/// One backend target of a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Host to dial.
    pub connect_host: String,

    /// Port to dial.
    pub connect_port: u16,

    /// Host to put in the outbound request URI instead of the client's.
    pub host: Option<String>,

    /// Use TLS (wss) towards the target.
    #[serde(default)]
    pub secure: bool,

    /// Exempt this target from the private-address policy.
    #[serde(default)]
    pub trusted: bool,

    /// Skip TLS certificate validation.
    #[serde(default)]
    pub insecure: bool,

    /// Channel to subscribe the session to on connect.
    pub sub_channel: Option<String>,
}

/// X-Forwarded-For rewrite rule.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct XffRule {
    /// Keep only the last N existing entries (`None` = keep all).
    pub truncate: Option<usize>,

    /// Append the peer address.
    pub append: bool,
}

/// Per-session proxying configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum unacknowledged frames per direction.
    pub max_pending_frames: usize,

    /// Outbound connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Default signing identity when a route has none.
    pub sig_iss: Option<String>,

    /// Default signing key when a route has none.
    pub sig_key: Option<String>,

    /// Add X-Forwarded-Protocol to outbound requests.
    pub use_x_forwarded_protocol: bool,

    /// X-Forwarded-For rule for untrusted clients.
    pub xff_untrusted: XffRule,

    /// X-Forwarded-For rule for trusted clients.
    pub xff_trusted: XffRule,

    /// Peer addresses whose requests are trusted. A trusted peer's
    /// `X-Forwarded-Proto: https` marks its requests as wss.
    pub trusted_peers: Vec<IpAddr>,

    /// Refuse to dial loopback, private and link-local addresses unless the
    /// target is marked `trusted`.
    pub deny_private_targets: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: 100,
            connect_timeout_secs: 10,
            sig_iss: None,
            sig_key: None,
            use_x_forwarded_protocol: false,
            xff_untrusted: XffRule {
                truncate: Some(0),
                append: true,
            },
            xff_trusted: XffRule {
                truncate: None,
                append: true,
            },
            trusted_peers: Vec::new(),
            deny_private_targets: false,
        }
    }
}

/// Control channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Attach the control hub to sessions.
    ///
    /// The binary only logs the hub's outbound packets: no broker link is
    /// bundled, so nothing calls `ControlHub::deliver` and pushes or
    /// detaches never arrive. Backends still get grip filtering and their
    /// `c:` messages are diverted. Embedders wire a broker by draining the
    /// receiver from `ControlHub::new` and delivering its events.
    pub enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
