//! In-memory domain store
//!
//! Both populations live under a single reader/writer lock so a membership
//! check sees a consistent snapshot of exact names and patterns. Reads take
//! shared access; an arbitrary number of concurrent `has()` calls proceed
//! without blocking each other.

use std::collections::HashMap;

use async_trait::async_trait;
use globset::GlobMatcher;
use parking_lot::RwLock;

use super::{compile_pattern, is_pattern, DomainStore};
use crate::error::Result;
use crate::feed::{parse_lines, FeedReader};

#[derive(Default)]
struct Inner {
    /// Lowercased exact names
    exact: HashMap<String, bool>,
    /// Compiled matchers keyed by original pattern text
    patterns: HashMap<String, GlobMatcher>,
}

impl Inner {
    fn put(&mut self, key: &str, value: bool) -> Result<()> {
        if is_pattern(key) {
            let matcher = compile_pattern(key)?;
            self.patterns.insert(key.to_string(), matcher);
        } else {
            self.exact.insert(key.to_ascii_lowercase(), value);
        }
        Ok(())
    }
}

/// Domain store holding every entry in RAM.
///
/// Used for the whitelist, and for the blacklist when no `db_file` is
/// configured.
#[derive(Default)]
pub struct MemDomainStore {
    inner: RwLock<Inner>,
}

impl MemDomainStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded from a list of names/patterns.
    ///
    /// # Errors
    ///
    /// Returns the first pattern compilation failure.
    pub fn with_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            for entry in entries {
                inner.put(entry.as_ref(), true)?;
            }
        }
        Ok(store)
    }
}

#[async_trait]
impl DomainStore for MemDomainStore {
    fn put(&self, key: &str, value: bool) -> Result<()> {
        self.inner.write().put(key, value)
    }

    fn has(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let inner = self.inner.read();
        inner.exact.contains_key(&domain)
            || inner.patterns.values().any(|g| g.is_match(&domain))
    }

    fn forget(&self, key: &str) {
        let mut inner = self.inner.write();
        if is_pattern(key) {
            inner.patterns.remove(key);
        } else {
            inner.exact.remove(&key.to_ascii_lowercase());
        }
    }

    async fn update(&self, reader: FeedReader) -> Result<usize> {
        // Tokens are collected first so the lock is never held across await.
        let mut entries = Vec::new();
        parse_lines(reader, |token| {
            entries.push(token.to_string());
            true
        })
        .await?;

        let mut inner = self.inner.write();
        let mut count = 0;
        for key in &entries {
            if inner.put(key, true).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.exact.len() + inner.patterns.len()
    }
}
