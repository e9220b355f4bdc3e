//! Domain stores
//!
//! A domain store is a set-with-membership over two disjoint populations:
//! an exact set of lowercased names and a pattern set of compiled glob
//! matchers keyed by their original text. Insertion routes by character
//! class: a key containing any of `* ? [ ]` is a pattern, anything else is
//! an exact name.
//!
//! Two variants share the [`DomainStore`] contract:
//!
//! - [`MemDomainStore`]: both populations in RAM under a reader/writer lock
//! - [`DbDomainStore`]: exact names and pattern text persisted in an
//!   embedded KV file, with patterns hot-loaded into RAM at open
//!
//! Membership is `exact[name] OR any pattern matches name`, with the query
//! side lowercased so `has()` is case-insensitive regardless of how entries
//! were written.

mod db;
mod mem;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};

pub use db::DbDomainStore;
pub use mem::MemDomainStore;

use crate::error::{Error, Result};
use crate::feed::FeedReader;

/// Characters that route a key into the pattern population.
pub const GLOB_CHARS: &[char] = &['*', '?', '[', ']'];

/// Check whether a key is a glob pattern rather than an exact name.
#[must_use]
pub fn is_pattern(key: &str) -> bool {
    key.contains(GLOB_CHARS)
}

/// Compile a glob pattern into a matcher.
///
/// # Errors
///
/// Returns [`Error::PatternCompile`] when the pattern is not valid glob
/// syntax.
pub(crate) fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| Error::pattern(pattern, e))
}

/// Shared contract of the blacklist and whitelist stores.
///
/// `has()` must be safe under arbitrary concurrent `put`/`forget`, and
/// concurrent `has()` calls must never block each other.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Insert a name or pattern. Routing between the exact and pattern
    /// populations follows [`is_pattern`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::PatternCompile`] for an invalid pattern and
    /// [`Error::StoreIo`] when the persistent backend fails.
    fn put(&self, key: &str, value: bool) -> Result<()>;

    /// Check membership. The name is lowercased, matched against the exact
    /// set first, then against every compiled pattern.
    fn has(&self, domain: &str) -> bool;

    /// Remove a name or pattern from exactly one population, using the same
    /// routing rule as [`DomainStore::put`].
    fn forget(&self, key: &str);

    /// Ingest a feed. Entries are batched; lines whose pattern fails to
    /// compile are skipped. Returns the number of entries stored.
    ///
    /// # Errors
    ///
    /// Returns a feed error on a terminal read failure or a store error
    /// when the batch cannot be written.
    async fn update(&self, reader: FeedReader) -> Result<usize>;

    /// Number of entries across both populations.
    fn len(&self) -> usize;

    /// True when the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
