//! Persistent domain store
//!
//! Entries live in an embedded ordered KV file with two tables: `domains`
//! holds lowercased exact names and `patterns` holds pattern text in its
//! original case, both mapped to a serialized boolean. Exact lookups go to
//! disk; patterns are hot-loaded into a RAM index at open so matching stays
//! O(#patterns) without touching the file.
//!
//! Mutations write through to disk and update the RAM index under a lock.
//! Feed ingestion batches all entries of a source into a single write
//! transaction. The file is owned exclusively by the process for its
//! lifetime; dropping the store releases it with all transactions durable.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use globset::GlobMatcher;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, warn};

use super::{compile_pattern, is_pattern, DomainStore};
use crate::error::{Error, Result};
use crate::feed::{parse_lines, FeedReader};

/// Lowercased exact names.
const DOMAIN_TABLE: TableDefinition<&str, bool> = TableDefinition::new("domains");

/// Glob pattern text, original case preserved.
const PATTERN_TABLE: TableDefinition<&str, bool> = TableDefinition::new("patterns");

/// Domain store backed by an embedded KV file.
pub struct DbDomainStore {
    db: Database,
    /// Hot pattern index; keys mirror the `patterns` table.
    patterns: RwLock<HashMap<String, GlobMatcher>>,
}

impl DbDomainStore {
    /// Open (or create) the store file and hot-load the pattern index.
    ///
    /// Persisted patterns that no longer compile are skipped with a
    /// warning; they remain on disk until forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreOpen`] when the file cannot be opened or the
    /// tables cannot be initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_display = path.display().to_string();

        let db = Database::create(path).map_err(|e| Error::store_open(&path_display, e))?;

        let txn = db
            .begin_write()
            .map_err(|e| Error::store_open(&path_display, e))?;
        {
            txn.open_table(DOMAIN_TABLE)
                .map_err(|e| Error::store_open(&path_display, e))?;
            txn.open_table(PATTERN_TABLE)
                .map_err(|e| Error::store_open(&path_display, e))?;
        }
        txn.commit().map_err(|e| Error::store_open(&path_display, e))?;

        let mut patterns = HashMap::new();
        let txn = db
            .begin_read()
            .map_err(|e| Error::store_open(&path_display, e))?;
        let table = txn
            .open_table(PATTERN_TABLE)
            .map_err(|e| Error::store_open(&path_display, e))?;
        for item in table.iter().map_err(|e| Error::store_open(&path_display, e))? {
            let (key, _) = item.map_err(|e| Error::store_open(&path_display, e))?;
            let pattern = key.value().to_string();
            match compile_pattern(&pattern) {
                Ok(matcher) => {
                    patterns.insert(pattern, matcher);
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "skipping persisted pattern"),
            }
        }
        drop(txn);

        debug!(path = %path_display, patterns = patterns.len(), "domain store opened");

        Ok(Self {
            db,
            patterns: RwLock::new(patterns),
        })
    }

    fn write_entry(
        &self,
        table: TableDefinition<'static, &'static str, bool>,
        key: &str,
        value: bool,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::store)?;
        {
            let mut table = txn.open_table(table).map_err(Error::store)?;
            table.insert(key, value).map_err(Error::store)?;
        }
        txn.commit().map_err(Error::store)
    }

    fn remove_entry(
        &self,
        table: TableDefinition<'static, &'static str, bool>,
        key: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::store)?;
        {
            let mut table = txn.open_table(table).map_err(Error::store)?;
            table.remove(key).map_err(Error::store)?;
        }
        txn.commit().map_err(Error::store)
    }
}

#[async_trait]
impl DomainStore for DbDomainStore {
    fn put(&self, key: &str, value: bool) -> Result<()> {
        if is_pattern(key) {
            let matcher = compile_pattern(key)?;
            self.write_entry(PATTERN_TABLE, key, value)?;
            self.patterns.write().insert(key.to_string(), matcher);
            Ok(())
        } else {
            self.write_entry(DOMAIN_TABLE, &key.to_ascii_lowercase(), value)
        }
    }

    fn has(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();

        // Membership is presence of the key; the stored value is ignored.
        if let Ok(txn) = self.db.begin_read() {
            if let Ok(table) = txn.open_table(DOMAIN_TABLE) {
                if matches!(table.get(domain.as_str()), Ok(Some(_))) {
                    return true;
                }
            }
        }

        let patterns = self.patterns.read();
        patterns.values().any(|g| g.is_match(&domain))
    }

    fn forget(&self, key: &str) {
        let result = if is_pattern(key) {
            self.patterns.write().remove(key);
            self.remove_entry(PATTERN_TABLE, key)
        } else {
            self.remove_entry(DOMAIN_TABLE, &key.to_ascii_lowercase())
        };
        if let Err(e) = result {
            debug!(key = %key, error = %e, "forget failed on disk");
        }
    }

    async fn update(&self, reader: FeedReader) -> Result<usize> {
        let mut exact = Vec::new();
        let mut patterns = Vec::new();

        parse_lines(reader, |token| {
            if is_pattern(token) {
                match compile_pattern(token) {
                    Ok(matcher) => {
                        patterns.push((token.to_string(), matcher));
                        true
                    }
                    Err(_) => false,
                }
            } else {
                exact.push(token.to_ascii_lowercase());
                true
            }
        })
        .await?;

        let count = exact.len() + patterns.len();
        if count == 0 {
            return Ok(0);
        }

        // One bulk write per source, covering both tables.
        let txn = self.db.begin_write().map_err(Error::store)?;
        {
            let mut table = txn.open_table(DOMAIN_TABLE).map_err(Error::store)?;
            for name in &exact {
                table.insert(name.as_str(), true).map_err(Error::store)?;
            }
            let mut table = txn.open_table(PATTERN_TABLE).map_err(Error::store)?;
            for (pattern, _) in &patterns {
                table.insert(pattern.as_str(), true).map_err(Error::store)?;
            }
        }
        txn.commit().map_err(Error::store)?;

        let mut index = self.patterns.write();
        for (pattern, matcher) in patterns {
            index.insert(pattern, matcher);
        }

        Ok(count)
    }

    fn len(&self) -> usize {
        let exact = self
            .db
            .begin_read()
            .ok()
            .and_then(|txn| txn.open_table(DOMAIN_TABLE).ok())
            .and_then(|table| table.len().ok())
            .unwrap_or(0);
        exact as usize + self.patterns.read().len()
    }
}
