//! Configuration surface
//!
//! The proxy is configured from a single YAML file. Every field has a
//! serde-supplied default so a minimal file only needs `nameservers` and
//! `blacklist_sources`:
//!
//! ```yaml
//! listen_address: "0.0.0.0:53"
//! nameservers:
//!   - "1.1.1.1:53"
//!   - "9.9.9.9:853"
//!   - "https://cloudflare-dns.com/dns-query"
//! blacklist_sources:
//!   - "https://example.org/hosts.txt"
//!   - "file:///var/lib/sinkhole/extra.txt"
//! whitelist_domains:
//!   - "good.example"
//!   - "*.cdn.example"
//! db_file: "sinkhole.db"
//! reject_mode: sinkhole
//! ```
//!
//! Nameserver order matters: it fixes the staggered-launch sequence of the
//! upstream race, and the first plain `host:port` entry doubles as the
//! bootstrap resolver for the HTTP client.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

fn default_listen_address() -> String {
    "127.0.0.1:53".to_string()
}

fn default_switch_interval_ms() -> u64 {
    500
}

fn default_query_timeout_ms() -> u64 {
    2000
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_reject_ttl() -> u32 {
    3600
}

fn default_cache_max_ttl_secs() -> u64 {
    600
}

fn default_cache_cleanup_interval_secs() -> u64 {
    300
}

/// How blacklisted queries are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectMode {
    /// Forge an answer pointing at an unroutable address
    #[default]
    Sinkhole,
    /// Answer with NXDOMAIN and an empty answer section
    Nxdomain,
}

/// Top-level configuration, deserialized from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address both the UDP and TCP listeners bind to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Ordered upstream endpoints: `host:port`, `host:853` (DoT) or an
    /// `https://` URL (DoH)
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// Blacklist feed URIs (`file://` or `http(s)://`)
    #[serde(default)]
    pub blacklist_sources: Vec<String>,

    /// Names or glob patterns that are never rejected
    #[serde(default)]
    pub whitelist_domains: Vec<String>,

    /// Path to the persistent blacklist file; empty means in-memory only
    #[serde(default)]
    pub db_file: String,

    /// Delay between staggered probe launches (milliseconds)
    #[serde(default = "default_switch_interval_ms")]
    pub switch_interval_ms: u64,

    /// Per-probe deadline (milliseconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Overall HTTP client timeout for DoH and feed downloads (seconds)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Reject behavior for blacklisted names
    #[serde(default)]
    pub reject_mode: RejectMode,

    /// TTL carried by forged reject answers (seconds)
    #[serde(default = "default_reject_ttl")]
    pub reject_ttl: u32,

    /// Upper bound on cached answer lifetime (seconds)
    #[serde(default = "default_cache_max_ttl_secs")]
    pub cache_max_ttl_secs: u64,

    /// Interval between active cache sweeps (seconds)
    #[serde(default = "default_cache_cleanup_interval_secs")]
    pub cache_cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty mapping deserializes with defaults")
    }
}

impl Config {
    /// Load and validate configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file is missing, unparsable, or
    /// fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("unable to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            Error::config(format!("invalid configuration file {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.nameservers.is_empty() {
            return Err(Error::config_field(
                "at least one nameserver is required",
                "nameservers",
            ));
        }
        for ns in &self.nameservers {
            if ns.trim().is_empty() {
                return Err(Error::config_field("empty nameserver entry", "nameservers"));
            }
        }
        if self.switch_interval_ms == 0 {
            return Err(Error::config_field(
                "must be positive",
                "switch_interval_ms",
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(Error::config_field("must be positive", "query_timeout_ms"));
        }
        if self.cache_max_ttl_secs == 0 {
            return Err(Error::config_field("must be positive", "cache_max_ttl_secs"));
        }
        if self.cache_cleanup_interval_secs == 0 {
            return Err(Error::config_field(
                "must be positive",
                "cache_cleanup_interval_secs",
            ));
        }
        Ok(())
    }

    /// Parse the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is not `ip:port`.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            Error::config_field(
                format!("invalid listen address '{}': {e}", self.listen_address),
                "listen_address",
            )
        })
    }

    /// Stagger interval between probe launches.
    #[must_use]
    pub fn switch_interval(&self) -> Duration {
        Duration::from_millis(self.switch_interval_ms)
    }

    /// Per-probe deadline.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Overall HTTP client timeout.
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Upper bound on cached answer lifetime.
    #[must_use]
    pub fn cache_max_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_max_ttl_secs)
    }

    /// Interval between active cache sweeps.
    #[must_use]
    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }

    /// Reject behavior, TTL and null routes bundled for the query engine.
    #[must_use]
    pub fn reject(&self) -> RejectConfig {
        RejectConfig {
            mode: self.reject_mode,
            ttl: self.reject_ttl,
            ..RejectConfig::default()
        }
    }
}

/// Reject behavior threaded through the query engine at construction.
#[derive(Debug, Clone, Copy)]
pub struct RejectConfig {
    /// Reject mode (sinkhole answer or NXDOMAIN)
    pub mode: RejectMode,
    /// TTL carried by forged answers (seconds)
    pub ttl: u32,
    /// Sinkhole target for A queries
    pub null_route_v4: Ipv4Addr,
    /// Sinkhole target for AAAA queries
    pub null_route_v6: Ipv6Addr,
}

impl Default for RejectConfig {
    fn default() -> Self {
        Self {
            mode: RejectMode::Sinkhole,
            ttl: default_reject_ttl(),
            null_route_v4: Ipv4Addr::UNSPECIFIED,
            null_route_v6: Ipv6Addr::UNSPECIFIED,
        }
    }
}
