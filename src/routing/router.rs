//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Resolve (secure, host, path) to a route entry and its targets
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan over priority-ordered routes (acceptable for typical route counts)
//! - Explicit NoMatch rather than silent default

use crate::config::{RouteConfig, TargetConfig};
use crate::routing::matcher::{
    AndMatcher, HostMatcher, Matcher, PathPrefixMatcher, RouteQuery, SecureMatcher,
};

/// A single candidate backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub connect_host: String,
    pub connect_port: u16,
    /// Overrides the host of the outbound request URI.
    pub host: Option<String>,
    pub secure: bool,
    pub trusted: bool,
    pub insecure: bool,
    /// Channel to force-subscribe on attach.
    pub sub_channel: Option<String>,
}

impl From<&TargetConfig> for Target {
    fn from(config: &TargetConfig) -> Self {
        Self {
            connect_host: config.connect_host.clone(),
            connect_port: config.connect_port,
            host: config.host.clone().filter(|h| !h.is_empty()),
            secure: config.secure,
            trusted: config.trusted,
            insecure: config.insecure,
            sub_channel: config.sub_channel.clone().filter(|c| !c.is_empty()),
        }
    }
}

/// The result of a successful route lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteEntry {
    pub name: String,
    pub channel_prefix: String,
    pub sig_iss: Option<String>,
    pub sig_key: Option<String>,
    pub targets: Vec<Target>,
}

#[derive(Debug)]
struct CompiledRoute {
    matcher: AndMatcher,
    priority: u32,
    entry: RouteEntry,
}

/// Immutable routing table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compile routes from configuration, highest priority first.
    pub fn from_config(configs: Vec<RouteConfig>) -> Self {
        let mut routes: Vec<CompiledRoute> = configs
            .into_iter()
            .map(|config| {
                let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
                if let Some(host) = config.host.filter(|h| !h.is_empty() && h != "*") {
                    matchers.push(Box::new(HostMatcher::new(host)));
                }
                if let Some(prefix) = config.path_prefix {
                    matchers.push(Box::new(PathPrefixMatcher::new(prefix)));
                }
                if let Some(secure) = config.secure {
                    matchers.push(Box::new(SecureMatcher::new(secure)));
                }

                CompiledRoute {
                    matcher: AndMatcher::new(matchers),
                    priority: config.priority,
                    entry: RouteEntry {
                        name: config.name,
                        channel_prefix: config.channel_prefix,
                        sig_iss: config.sig_iss,
                        sig_key: config.sig_key,
                        targets: config.targets.iter().map(Target::from).collect(),
                    },
                }
            })
            .collect();

        // Stable sort keeps file order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self { routes }
    }

    /// Find the first route matching the request.
    pub fn resolve(&self, secure: bool, host: &str, path: &str) -> Option<&RouteEntry> {
        let query = RouteQuery { secure, host, path };
        self.routes
            .iter()
            .find(|route| route.matcher.matches(&query))
            .map(|route| &route.entry)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
