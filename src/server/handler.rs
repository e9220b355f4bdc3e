//! Query engine
//!
//! One pass per request, in order:
//!
//! 1. Extract the first question and compute its fingerprint
//! 2. Cache lookup; on a fresh entry, rewrite the transaction ID and reply
//! 3. Whitelist check
//! 4. Blacklist check, only for INET A/AAAA questions that are not
//!    whitelisted
//! 5. Reject path: forge an NXDOMAIN or sinkhole reply and cache it
//! 6. Forward path: race the upstreams, reply, cache with the computed TTL
//!
//! A request always produces exactly one reply; any surfaced lookup error
//! becomes SERVFAIL rather than a dropped request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Header, Message, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::{debug, error, warn};

use super::DnsRequest;
use crate::cache::{fingerprint, normalize_qname, response_ttl, AnswerCache};
use crate::config::{RejectConfig, RejectMode};
use crate::store::DomainStore;
use crate::upstream::{Resolver, Transport};

/// Counters over the engine's decision paths.
#[derive(Debug, Default)]
pub struct EngineStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    rejected: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl EngineStats {
    /// Total requests dequeued.
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Replies served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Forged reject replies.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Requests answered by an upstream.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Requests that ended in SERVFAIL.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// The decision core: classifies each question against the white/blacklist
/// stores, serves from cache, forges rejects, or forwards upstream.
pub struct QueryEngine {
    resolver: Arc<dyn Resolver>,
    blacklist: Arc<dyn DomainStore>,
    whitelist: Arc<dyn DomainStore>,
    cache: Arc<AnswerCache>,
    reject: RejectConfig,
    stats: EngineStats,
}

impl QueryEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        resolver: Arc<dyn Resolver>,
        blacklist: Arc<dyn DomainStore>,
        whitelist: Arc<dyn DomainStore>,
        cache: Arc<AnswerCache>,
        reject: RejectConfig,
    ) -> Self {
        Self {
            resolver,
            blacklist,
            whitelist,
            cache,
            reject,
            stats: EngineStats::default(),
        }
    }

    /// Engine statistics.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Process a dequeued request and write the reply to its responder.
    ///
    /// Encode and responder failures are logged and recovered; they never
    /// propagate into the worker.
    pub async fn handle(&self, request: DnsRequest) {
        let DnsRequest {
            transport,
            message,
            responder,
        } = request;

        let reply = self.process(transport, &message).await;
        match reply.to_vec() {
            Ok(payload) => responder.send(payload).await,
            Err(e) => error!(error = %e, "failed to encode reply"),
        }
    }

    /// Run a request through the decision pipeline, always producing a
    /// reply message.
    pub async fn process(&self, transport: Transport, request: &Message) -> Message {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let Some(question) = request.queries().first().cloned() else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            debug!("request without a question section");
            return servfail(request);
        };

        let qname = normalize_qname(&question.name().to_string());
        let key = fingerprint(&qname, question.query_type(), question.query_class());

        if let Some(mut cached) = self.cache.get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            // The stored reply keeps the ID it was inserted with.
            cached.set_id(request.id());
            debug!(qname = %qname, transport = %transport, "answered from cache");
            return cached;
        }

        let whitelisted = self.whitelist.has(&qname);
        if is_ip_query(&question) && !whitelisted && self.blacklist.has(&qname) {
            let reply = self.reject_reply(request, &question);
            self.cache.insert_default(key, &reply);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(qname = %qname, transport = %transport, "query rejected");
            return reply;
        }

        match self.resolver.lookup(transport, request).await {
            Ok(reply) => {
                let ttl = response_ttl(&reply, self.cache.max_ttl());
                self.cache.insert(key, &reply, ttl);
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                debug!(qname = %qname, transport = %transport, "query forwarded");
                reply
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(qname = %qname, transport = %transport, error = %e, "lookup failed");
                servfail(request)
            }
        }
    }

    /// Forge the reject reply for a blacklisted question.
    fn reject_reply(&self, request: &Message, question: &Query) -> Message {
        let mut reply = Message::new();
        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        match self.reject.mode {
            RejectMode::Nxdomain => {
                header.set_response_code(ResponseCode::NXDomain);
                reply.set_header(header);
                reply.add_query(question.clone());
            }
            RejectMode::Sinkhole => {
                header.set_response_code(ResponseCode::NoError);
                reply.set_header(header);
                reply.add_query(question.clone());

                let rdata = match question.query_type() {
                    RecordType::A => RData::A(A(self.reject.null_route_v4)),
                    RecordType::AAAA => RData::AAAA(AAAA(self.reject.null_route_v6)),
                    // The reject path is gated on A/AAAA questions.
                    _ => return reply,
                };
                let mut record =
                    Record::from_rdata(question.name().clone(), self.reject.ttl, rdata);
                record.set_dns_class(DNSClass::IN);
                reply.add_answer(record);
            }
        }

        reply
    }
}

/// An IP query is class INET with type A or AAAA; only these are subject
/// to the blacklist.
fn is_ip_query(question: &Query) -> bool {
    question.query_class() == DNSClass::IN
        && matches!(question.query_type(), RecordType::A | RecordType::AAAA)
}

/// Build a SERVER_FAILURE reply echoing the request's questions.
pub(crate) fn servfail(request: &Message) -> Message {
    let mut reply = Message::new();
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);
    header.set_recursion_available(true);
    reply.set_header(header);
    for question in request.queries() {
        reply.add_query(question.clone());
    }
    reply
}
