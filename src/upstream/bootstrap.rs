//! Bootstrap name resolution for the HTTP client
//!
//! DoH probes and feed downloads must not depend on the host's system
//! resolver: if the system resolver points at this very proxy (a common
//! deployment), startup would deadlock on itself. The HTTP client's
//! resolution is therefore pinned to the first configured plain upstream,
//! queried directly over UDP.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::time::timeout;

use super::exchange::udp_exchange;
use crate::error::{Error, Result};

/// `reqwest` resolver pinned to a single upstream nameserver.
pub struct PinnedResolver {
    nameserver: String,
    query_timeout: Duration,
}

impl PinnedResolver {
    /// Pin resolution to `nameserver` (a plain `host:port` endpoint).
    pub fn new(nameserver: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            nameserver: nameserver.into(),
            query_timeout,
        }
    }

    async fn lookup(&self, host: &str) -> Result<Vec<SocketAddr>> {
        let name = to_fqdn(host)?;

        // A first; fall back to AAAA for v6-only names.
        let mut addrs = self.query_once(&name, RecordType::A).await?;
        if addrs.is_empty() {
            addrs = self.query_once(&name, RecordType::AAAA).await?;
        }
        if addrs.is_empty() {
            return Err(Error::upstream_transport(
                &self.nameserver,
                format!("no address records for {host}"),
            ));
        }
        Ok(addrs)
    }

    async fn query_once(&self, name: &Name, qtype: RecordType) -> Result<Vec<SocketAddr>> {
        let mut query = Message::new();
        query.set_id(bootstrap_id());
        query.set_recursion_desired(true);
        query.add_query(Query::query(name.clone(), qtype));

        let reply = timeout(self.query_timeout, udp_exchange(&self.nameserver, &query))
            .await
            .map_err(|_| Error::upstream_timeout(&self.nameserver, self.query_timeout))??;

        let mut addrs = Vec::new();
        for answer in reply.answers() {
            match answer.data() {
                Some(RData::A(a)) => addrs.push(SocketAddr::new(IpAddr::V4(a.0), 0)),
                Some(RData::AAAA(aaaa)) => addrs.push(SocketAddr::new(IpAddr::V6(aaaa.0), 0)),
                _ => {}
            }
        }
        Ok(addrs)
    }
}

impl reqwest::dns::Resolve for PinnedResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let resolver = Self {
            nameserver: self.nameserver.clone(),
            query_timeout: self.query_timeout,
        };
        Box::pin(async move {
            let addrs = resolver.lookup(name.as_str()).await?;
            let iter: reqwest::dns::Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

fn to_fqdn(host: &str) -> Result<Name> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{host}.")
    };
    Name::from_utf8(&fqdn).map_err(|e| Error::decode(format!("invalid hostname {host}: {e}")))
}

/// Transaction ID for bootstrap queries, derived from the clock since no
/// RNG is linked for this one cold path.
fn bootstrap_id() -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos & 0xFFFF) as u16
}
