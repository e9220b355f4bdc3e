//! Answer cache
//!
//! A TTL-bounded mapping from question fingerprint to response message.
//! Expiration is passive on read (the backing cache never returns an
//! expired entry) plus an active periodic sweep at the configured cleanup
//! interval. The stored response keeps the transaction ID it was inserted
//! with; callers rewrite the ID from the request before sending.
//!
//! The fingerprint is the canonical string form of
//! `(qname_lower_unfqdn, qtype, qclass)`, e.g. `"ads.example A IN"`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RecordType};
use moka::sync::Cache;
use moka::Expiry;
use tracing::trace;

/// Cache TTL used for forwarded answers that carry no positive TTL.
const DEFAULT_ANSWER_TTL: u32 = 600;

/// Lowercase a query name and strip the trailing root dot.
#[must_use]
pub fn normalize_qname(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Canonical cache key for a question.
#[must_use]
pub fn fingerprint(qname: &str, qtype: RecordType, qclass: DNSClass) -> String {
    format!("{} {} {}", normalize_qname(qname), qtype, qclass)
}

/// Compute the cache TTL for a forwarded response: the minimum positive
/// answer TTL (default 600 s when none), clamped by `max_ttl`.
#[must_use]
pub fn response_ttl(response: &Message, max_ttl: Duration) -> Duration {
    let mut ttl = DEFAULT_ANSWER_TTL;
    for answer in response.answers() {
        let answer_ttl = answer.ttl();
        if answer_ttl > 0 && answer_ttl < ttl {
            ttl = answer_ttl;
        }
    }
    Duration::from_secs(u64::from(ttl)).min(max_ttl)
}

#[derive(Clone)]
struct CachedAnswer {
    response: Message,
    ttl: Duration,
}

/// Per-entry expiration policy driven by the TTL recorded at insert.
struct AnswerExpiry;

impl Expiry<String, CachedAnswer> for AnswerExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedAnswer,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Statistics for the answer cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl CacheStats {
    /// Cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries inserted.
    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
}

/// TTL-bounded response cache keyed by question fingerprint.
///
/// Thread-safe for concurrent readers and writers; lookups return the
/// stored response by value.
pub struct AnswerCache {
    cache: Cache<String, CachedAnswer>,
    max_ttl: Duration,
    cleanup_interval: Duration,
    stats: CacheStats,
}

impl AnswerCache {
    /// Create a cache with the given TTL ceiling and sweep interval.
    #[must_use]
    pub fn new(max_ttl: Duration, cleanup_interval: Duration) -> Self {
        let cache = Cache::builder().expire_after(AnswerExpiry).build();
        Self {
            cache,
            max_ttl,
            cleanup_interval,
            stats: CacheStats::default(),
        }
    }

    /// The configured TTL ceiling.
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// Look up a fresh entry, returning the stored response by value.
    ///
    /// The response retains the transaction ID it was inserted with; the
    /// caller must rewrite it before sending.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Message> {
        match self.cache.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "cache hit");
                Some(entry.response)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a response with an explicit TTL, clamped by the ceiling.
    pub fn insert(&self, key: String, response: &Message, ttl: Duration) {
        let ttl = ttl.min(self.max_ttl);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(
            key,
            CachedAnswer {
                response: response.clone(),
                ttl,
            },
        );
    }

    /// Insert a response with the cache's default TTL (the ceiling).
    ///
    /// Used for forged reject replies.
    pub fn insert_default(&self, key: String, response: &Message) {
        self.insert(key, response, self.max_ttl);
    }

    /// Approximate number of live entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// True when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache statistics.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Spawn the active sweep task, evicting expired entries every cleanup
    /// interval for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cache.cleanup_interval).await;
                cache.cache.run_pending_tasks();
                trace!(entries = cache.len(), "cache sweep");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn response_with_ttls(ttls: &[u32]) -> Message {
        let name = Name::from_str("cached.example.").unwrap();
        let mut message = Message::new();
        message.set_id(0x1111);
        message.add_query(Query::query(name.clone(), RecordType::A));
        for ttl in ttls {
            message.add_answer(Record::from_rdata(
                name.clone(),
                *ttl,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
            ));
        }
        message
    }

    // ========================================================================
    // Fingerprint Tests
    // ========================================================================

    #[test]
    fn test_normalize_qname() {
        assert_eq!(normalize_qname("Ads.Example."), "ads.example");
        assert_eq!(normalize_qname("ads.example"), "ads.example");
        assert_eq!(normalize_qname("."), "");
    }

    #[test]
    fn test_fingerprint_is_case_insensitive() {
        let a = fingerprint("ADS.Example.", RecordType::A, DNSClass::IN);
        let b = fingerprint("ads.example", RecordType::A, DNSClass::IN);
        assert_eq!(a, b);
        assert_eq!(a, "ads.example A IN");
    }

    #[test]
    fn test_fingerprint_distinguishes_qtype() {
        let a = fingerprint("ads.example", RecordType::A, DNSClass::IN);
        let aaaa = fingerprint("ads.example", RecordType::AAAA, DNSClass::IN);
        assert_ne!(a, aaaa);
    }

    // ========================================================================
    // TTL Computation Tests
    // ========================================================================

    #[test]
    fn test_response_ttl_takes_minimum_positive() {
        let response = response_with_ttls(&[300, 60, 900]);
        assert_eq!(
            response_ttl(&response, Duration::from_secs(600)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_response_ttl_ignores_zero() {
        let response = response_with_ttls(&[0, 120]);
        assert_eq!(
            response_ttl(&response, Duration::from_secs(600)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_response_ttl_defaults_without_answers() {
        let response = response_with_ttls(&[]);
        assert_eq!(
            response_ttl(&response, Duration::from_secs(3600)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_response_ttl_clamped_by_max() {
        let response = response_with_ttls(&[86400]);
        assert_eq!(
            response_ttl(&response, Duration::from_secs(600)),
            Duration::from_secs(600)
        );
    }

    // ========================================================================
    // Cache Behavior Tests
    // ========================================================================

    #[test]
    fn test_insert_and_get() {
        let cache = AnswerCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let response = response_with_ttls(&[300]);
        let key = fingerprint("cached.example", RecordType::A, DNSClass::IN);

        cache.insert(key.clone(), &response, Duration::from_secs(300));
        let hit = cache.get(&key).expect("fresh entry");
        assert_eq!(hit.id(), 0x1111);
        assert_eq!(hit.answers().len(), 1);

        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().inserts(), 1);
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let cache = AnswerCache::new(Duration::from_secs(600), Duration::from_secs(60));
        assert!(cache.get("unknown A IN").is_none());
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = AnswerCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let response = response_with_ttls(&[1]);
        let key = "short.example A IN".to_string();

        cache.insert(key.clone(), &response, Duration::from_secs(1));
        assert!(cache.get(&key).is_some());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_stored_id_is_preserved() {
        let cache = AnswerCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let response = response_with_ttls(&[300]);
        let key = "id.example A IN".to_string();

        cache.insert_default(key.clone(), &response);
        // The cache hands back the originating ID untouched; rewriting is
        // the query engine's job.
        assert_eq!(cache.get(&key).unwrap().id(), 0x1111);
    }
}
