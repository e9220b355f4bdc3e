//! Error types for the DNS proxy
//!
//! A single error enum covers the whole pipeline: configuration, feed
//! ingestion, the domain stores, upstream resolution, and the wire codec.
//!
//! # Error Categories
//!
//! - **Config errors**: invalid configuration parameters
//! - **Feed errors**: blacklist source download/parse failures
//! - **Store errors**: persistent store open/IO and pattern compilation
//! - **Upstream errors**: probe timeouts, transport failures, bad rcodes
//! - **Codec errors**: DNS message encode/decode failures
//! - **Listener errors**: socket bind failures

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all proxy operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// A feed source could not be opened
    ///
    /// Covers malformed URIs, unsupported schemes, missing local files and
    /// request-level HTTP failures.
    #[error("failed to open feed {uri}: {reason}")]
    FeedOpen {
        /// The feed URI
        uri: String,
        /// Description of the failure
        reason: String,
    },

    /// A feed responded with a non-200 HTTP status
    #[error("feed {uri} returned HTTP {status}")]
    FeedHttpStatus {
        /// The feed URI
        uri: String,
        /// The HTTP status code
        status: u16,
    },

    /// A feed responded with an unexpected Content-Type
    #[error("feed {uri} has invalid content type: {content_type}")]
    FeedContentType {
        /// The feed URI
        uri: String,
        /// The Content-Type header value received
        content_type: String,
    },

    /// I/O error while streaming feed lines
    #[error("feed read error: {reason}")]
    FeedIo {
        /// Description of the failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// The persistent store file could not be opened
    #[error("failed to open domain store {path}: {reason}")]
    StoreOpen {
        /// Path to the store file
        path: String,
        /// Description of the failure
        reason: String,
    },

    /// A persistent store read or write failed
    #[error("domain store error: {reason}")]
    StoreIo {
        /// Description of the failure
        reason: String,
    },

    /// A glob pattern failed to compile
    #[error("invalid pattern entry `{pattern}`: {reason}")]
    PatternCompile {
        /// The offending pattern text
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// An upstream probe did not answer within its deadline
    #[error("upstream {upstream} timed out after {timeout:?}")]
    UpstreamTimeout {
        /// The upstream endpoint
        upstream: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// An upstream probe failed at the transport level
    #[error("upstream {upstream} transport error: {reason}")]
    UpstreamTransport {
        /// The upstream endpoint
        upstream: String,
        /// Description of the failure
        reason: String,
    },

    /// An upstream answered with a response code that disqualifies the probe
    #[error("upstream {upstream} answered with rcode {rcode}")]
    UpstreamBadRcode {
        /// The upstream endpoint
        upstream: String,
        /// The DNS response code
        rcode: u16,
    },

    /// Every probe in the race soft-failed
    #[error("no upstream nameserver produced an answer")]
    UpstreamUnreachable,

    /// DNS message serialization failed
    #[error("failed to encode DNS message: {reason}")]
    Encode {
        /// Description of the failure
        reason: String,
    },

    /// DNS message parsing failed
    #[error("failed to decode DNS message: {reason}")]
    Decode {
        /// Description of the failure
        reason: String,
    },

    /// A listener socket could not be bound
    #[error("failed to bind listener on {addr}")]
    ListenerBind {
        /// The listen address
        addr: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a feed open error.
    pub fn feed_open(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FeedOpen {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a feed I/O error from an underlying error.
    pub fn feed_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::FeedIo {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a store open error.
    pub fn store_open(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StoreOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a store I/O error.
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Self::StoreIo {
            reason: reason.to_string(),
        }
    }

    /// Create a pattern compilation error.
    pub fn pattern(pattern: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::PatternCompile {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an upstream timeout error.
    pub fn upstream_timeout(upstream: impl Into<String>, timeout: Duration) -> Self {
        Self::UpstreamTimeout {
            upstream: upstream.into(),
            timeout,
        }
    }

    /// Create an upstream transport error.
    pub fn upstream_transport(
        upstream: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::UpstreamTransport {
            upstream: upstream.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an encode error.
    pub fn encode(reason: impl std::fmt::Display) -> Self {
        Self::Encode {
            reason: reason.to_string(),
        }
    }

    /// Create a decode error.
    pub fn decode(reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            reason: reason.to_string(),
        }
    }

    /// Check whether this error is a probe timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UpstreamTimeout { .. })
    }

    /// Check whether this error is a soft probe failure.
    ///
    /// Soft failures (SERVFAIL answers, transport errors, timeouts) drop a
    /// single probe out of the race without failing the lookup.
    #[must_use]
    pub fn is_soft_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. }
                | Self::UpstreamTransport { .. }
                | Self::UpstreamBadRcode { .. }
        )
    }
}
