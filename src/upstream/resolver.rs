//! Staggered-race resolver
//!
//! Probes launch against the configured nameservers one stagger-interval
//! apart. A single-slot channel collects results: the first successful
//! `try_send` wins the race, later winners are dropped silently. If the
//! launch loop finishes without a result, the resolver waits for the
//! remaining probes and drains the slot once more before giving up.
//!
//! This keeps latency low when the first upstream is healthy while still
//! failing over, without flooding every upstream on every query.

use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::exchange::{doh_exchange, dot_exchange, tcp_exchange, tls_connector, udp_exchange};
use super::{Nameserver, Transport};
use crate::error::{Error, Result};

/// Upstream lookup contract consumed by the query engine.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Forward a request message upstream and return the first answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnreachable`] when every probe soft-fails.
    async fn lookup(&self, transport: Transport, query: &Message) -> Result<Message>;
}

/// Resolver racing a pool of upstreams with a staggered start.
pub struct RacingResolver {
    nameservers: Vec<Nameserver>,
    stagger: Duration,
    query_timeout: Duration,
    http: reqwest::Client,
    tls: TlsConnector,
}

impl RacingResolver {
    /// Build a resolver from endpoint strings, in launch order.
    ///
    /// The HTTP client is shared with feed ingestion so DoH inherits its
    /// pinned bootstrap resolution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the endpoint list is empty.
    pub fn new(
        endpoints: &[String],
        stagger: Duration,
        query_timeout: Duration,
        http: reqwest::Client,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::config_field(
                "at least one nameserver is required",
                "nameservers",
            ));
        }

        let nameservers = endpoints.iter().map(|e| Nameserver::parse(e)).collect();
        Ok(Self {
            nameservers,
            stagger,
            query_timeout,
            http,
            tls: tls_connector(),
        })
    }

    /// The classified upstream set, in launch order.
    #[must_use]
    pub fn nameservers(&self) -> &[Nameserver] {
        &self.nameservers
    }
}

#[async_trait]
impl Resolver for RacingResolver {
    async fn lookup(&self, transport: Transport, query: &Message) -> Result<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let mut probes = JoinSet::new();

        for ns in &self.nameservers {
            let ns = ns.clone();
            let tx = tx.clone();
            let query = query.clone();
            let http = self.http.clone();
            let tls = self.tls.clone();
            let deadline = self.query_timeout;

            probes.spawn(async move {
                match probe(&ns, transport, &query, &http, &tls, deadline).await {
                    // First sender wins the single slot; a later winner is
                    // dropped here without ceremony.
                    Ok(reply) => {
                        let _ = tx.try_send(reply);
                    }
                    Err(e) => {
                        debug!(upstream = %ns, transport = %transport, error = %e, "probe failed");
                    }
                }
            });

            tokio::select! {
                Some(reply) = rx.recv() => {
                    // Dropping the JoinSet aborts the probes still in
                    // flight; they hold no resources past their sockets.
                    return Ok(reply);
                }
                () = sleep(self.stagger) => {}
            }
        }

        // All probes launched. Let them run to completion or deadline, then
        // take a late winner if one landed in the slot.
        drop(tx);
        while probes.join_next().await.is_some() {}

        match rx.try_recv() {
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::UpstreamUnreachable),
        }
    }
}

/// Run one probe: dispatch by endpoint kind, enforce the per-probe
/// deadline, and classify the outcome.
async fn probe(
    ns: &Nameserver,
    transport: Transport,
    query: &Message,
    http: &reqwest::Client,
    tls: &TlsConnector,
    deadline: Duration,
) -> Result<Message> {
    let exchange = async {
        match ns {
            Nameserver::Plain(addr) => match transport {
                Transport::Udp => udp_exchange(addr, query).await,
                Transport::Tcp => tcp_exchange(addr, query).await,
            },
            Nameserver::Tls(addr) => dot_exchange(addr, tls, query).await,
            Nameserver::Https(url) => doh_exchange(http, url, query).await,
        }
    };

    let reply = timeout(deadline, exchange)
        .await
        .map_err(|_| Error::upstream_timeout(ns.endpoint(), deadline))??;

    let rcode = reply.response_code();
    if rcode == ResponseCode::ServFail {
        // A server failure is a soft failure, not a race result.
        return Err(Error::UpstreamBadRcode {
            upstream: ns.endpoint().to_string(),
            rcode: u16::from(rcode.low()),
        });
    }
    if rcode != ResponseCode::NoError {
        // Other non-success rcodes (NXDOMAIN among them) are answers.
        warn!(upstream = %ns, rcode = %rcode, "non-success answer from upstream");
    } else {
        debug!(upstream = %ns, transport = %transport, "answer from upstream");
    }
    Ok(reply)
}
