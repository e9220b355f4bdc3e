//! Upstream resolution
//!
//! The resolver races an ordered list of nameservers with a staggered
//! start: probes launch one stagger-interval apart, the first successful
//! answer wins, and probes that lose the race are abandoned. Endpoints are
//! classified once at construction:
//!
//! | Endpoint form            | Protocol                     |
//! |--------------------------|------------------------------|
//! | `host:port`              | plain DNS (UDP or TCP)       |
//! | `host:853`               | DNS-over-TLS (RFC 7858)      |
//! | `https://…`              | DNS-over-HTTPS (RFC 8484)    |

mod bootstrap;
mod exchange;
mod resolver;

use std::fmt;

pub use bootstrap::PinnedResolver;
pub use resolver::{RacingResolver, Resolver};

/// Port that selects DNS-over-TLS for a `host:port` endpoint.
const DOT_PORT_SUFFIX: &str = ":853";

/// Transport the client used to reach us, forwarded to plain upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Datagram transport
    Udp,
    /// Stream transport
    Tcp,
}

impl Transport {
    /// Lowercase protocol name for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nameserver {
    /// Plain DNS at `host:port`, queried over the requested transport
    Plain(String),
    /// DNS-over-TLS at `host:853`
    Tls(String),
    /// DNS-over-HTTPS at an `https://` URL
    Https(String),
}

impl Nameserver {
    /// Classify an endpoint string.
    #[must_use]
    pub fn parse(endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if endpoint.starts_with("https://") {
            Self::Https(endpoint.to_string())
        } else if endpoint.ends_with(DOT_PORT_SUFFIX) {
            Self::Tls(endpoint.to_string())
        } else {
            Self::Plain(endpoint.to_string())
        }
    }

    /// The endpoint string as configured.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Plain(e) | Self::Tls(e) | Self::Https(e) => e,
        }
    }
}

impl fmt::Display for Nameserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}
