//! In-memory query result cache.
//!
//! Keys are the SHA-256 of the raw query string, so lookups never depend on
//! tokenization details. Entries expire after a configurable TTL and are
//! evicted lazily on access. Any write to the knowledge base clears the
//! whole cache; with holes in the index there is no cheap way to tell which
//! cached answers a delete invalidated.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::QueryOutcome;

pub fn cache_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Entry {
    outcome: QueryOutcome,
    inserted_at: Instant,
}

pub struct QueryCache {
    ttl: Duration,
    entries: HashMap<String, Entry>,
}

impl QueryCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: HashMap::new(),
        }
    }

    /// Returns a fresh cached outcome, evicting the entry if it has expired.
    pub fn get(&mut self, query: &str) -> Option<QueryOutcome> {
        let key = cache_key(query);
        match self.entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some(entry.outcome.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, query: &str, outcome: QueryOutcome) {
        self.entries.insert(
            cache_key(query),
            Entry {
                outcome,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops every entry. Called after any upload, delete, or repair.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
