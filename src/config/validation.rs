//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (caps > 0, ports valid, addresses parse)
//! - Detect duplicate route names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),

    #[error("max_connections must be greater than zero")]
    NoConnections,

    #[error("max_pending_frames must be greater than zero")]
    NoPendingFrames,

    #[error("route '{0}' is defined more than once")]
    DuplicateRoute(String),

    #[error("route '{0}' has no targets")]
    NoTargets(String),

    #[error("route '{route}' has a target with an empty connect_host")]
    EmptyConnectHost { route: String },

    #[error("route '{route}' has a target with port 0")]
    ZeroPort { route: String },

    #[error("sig_iss and sig_key must be set together")]
    PartialSigning,
}

/// Check a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }
    if config.proxy.max_pending_frames == 0 {
        errors.push(ValidationError::NoPendingFrames);
    }
    if config.proxy.sig_iss.is_some() != config.proxy.sig_key.is_some() {
        errors.push(ValidationError::PartialSigning);
    }

    let mut names = HashSet::new();
    for route in &config.routes {
        if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }
        if route.targets.is_empty() {
            errors.push(ValidationError::NoTargets(route.name.clone()));
        }
        for target in &route.targets {
            if target.connect_host.is_empty() {
                errors.push(ValidationError::EmptyConnectHost {
                    route: route.name.clone(),
                });
            }
            if target.connect_port == 0 {
                errors.push(ValidationError::ZeroPort {
                    route: route.name.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
