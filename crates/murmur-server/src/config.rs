//! Admission service configuration loaded from environment variables.
//!
//! Every setting has a default so the service starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Global ceiling on simultaneously active leases.
    /// Env: `MAX_ACTIVE`
    /// Default: `200`
    pub max_active: usize,

    /// A lease with no heartbeat for this long is dropped.
    /// Env: `LEASE_TTL_SECS`
    /// Default: `60`
    pub lease_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            max_active: 200,
            lease_ttl: Duration::from_secs(60),
        }
    }
}

impl AdmissionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(val) = lookup("MAX_ACTIVE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_active = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ACTIVE, using default"),
            }
        }

        if let Some(val) = lookup("LEASE_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.lease_ttl = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid LEASE_TTL_SECS, using default"),
            }
        }

        config
    }
}
