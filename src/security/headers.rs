//! Header manipulation for outbound upgrade requests.
//!
//! # Responsibilities
//! - Decide whether the client is trusted
//! - Rewrite X-Forwarded-For by the trusted or untrusted rule
//! - Add X-Forwarded-Protocol (optional)
//! - Strip client-supplied Grip-Sig from untrusted clients
//!
//! # Design Decisions
//! - Preserve original client IP in X-Forwarded-For
//! - Never trust existing forwarding headers from untrusted sources
//! - Trust is decided by peer address; request signing is left to the
//!   deployment's signing layer

use std::net::IpAddr;

use axum::http::{HeaderName, HeaderValue};

use crate::config::{SessionConfig, XffRule};
use crate::routing::RouteEntry;
use crate::transport::socket::RequestData;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTOCOL: HeaderName = HeaderName::from_static("x-forwarded-protocol");
pub const GRIP_SIG: HeaderName = HeaderName::from_static("grip-sig");

/// Identity and key used to sign requests for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub iss: String,
    pub key: String,
}

impl SigningIdentity {
    /// The route's identity if it has both parts, else the default.
    pub fn resolve(route: &RouteEntry, default: Option<&SigningIdentity>) -> Option<SigningIdentity> {
        match (&route.sig_iss, &route.sig_key) {
            (Some(iss), Some(key)) if !iss.is_empty() && !key.is_empty() => Some(SigningIdentity {
                iss: iss.clone(),
                key: key.clone(),
            }),
            _ => default.cloned(),
        }
    }
}

/// Prepares the outbound request's headers.
pub trait HeaderEnricher: Send + Sync {
    /// Whether requests from `peer` may vouch for themselves (forwarding
    /// headers, client signatures).
    fn is_trusted(&self, peer: Option<IpAddr>) -> bool;

    /// Mutate `request` in place. Returns true if the client is trusted.
    fn enrich(
        &self,
        request: &mut RequestData,
        route: &RouteEntry,
        signing: Option<&SigningIdentity>,
        peer: Option<IpAddr>,
    ) -> bool;
}

/// Forwarding-header rules driven by configuration.
#[derive(Debug, Clone, Default)]
pub struct ForwardingEnricher {
    use_x_forwarded_protocol: bool,
    xff_untrusted: XffRule,
    xff_trusted: XffRule,
    trusted_peers: Vec<IpAddr>,
}

impl ForwardingEnricher {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            use_x_forwarded_protocol: config.use_x_forwarded_protocol,
            xff_untrusted: config.xff_untrusted.clone(),
            xff_trusted: config.xff_trusted.clone(),
            trusted_peers: config.trusted_peers.clone(),
        }
    }
}

fn apply_xff(request: &mut RequestData, rule: &XffRule, peer: Option<IpAddr>) {
    let mut entries: Vec<String> = request
        .headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if let Some(keep) = rule.truncate {
        let drop = entries.len().saturating_sub(keep);
        entries.drain(..drop);
    }

    if rule.append {
        if let Some(ip) = peer {
            entries.push(ip.to_string());
        }
    }

    request.headers.remove(&X_FORWARDED_FOR);
    if entries.is_empty() {
        return;
    }
    match HeaderValue::from_str(&entries.join(", ")) {
        Ok(value) => {
            request.headers.insert(X_FORWARDED_FOR, value);
        }
        Err(e) => tracing::debug!(error = %e, "Dropping unrepresentable X-Forwarded-For"),
    }
}

impl HeaderEnricher for ForwardingEnricher {
    fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        peer.is_some_and(|ip| self.trusted_peers.contains(&ip))
    }

    fn enrich(
        &self,
        request: &mut RequestData,
        route: &RouteEntry,
        signing: Option<&SigningIdentity>,
        peer: Option<IpAddr>,
    ) -> bool {
        let trusted = self.is_trusted(peer);

        if !trusted {
            request.headers.remove(&GRIP_SIG);
        }

        let rule = if trusted {
            &self.xff_trusted
        } else {
            &self.xff_untrusted
        };
        apply_xff(request, rule, peer);

        if self.use_x_forwarded_protocol {
            let secure = matches!(request.uri.scheme_str(), Some("wss") | Some("https"));
            let proto = if secure { "https" } else { "http" };
            request
                .headers
                .insert(X_FORWARDED_PROTOCOL, HeaderValue::from_static(proto));
        }

        if let Some(identity) = signing {
            tracing::trace!(route = %route.name, iss = %identity.iss, "Signing identity resolved");
        }

        trusted
    }
}
