// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Content-addressed parse cache.
//!
//! Parsed documents are keyed by a SHA-256 fingerprint of the raw document
//! text, so the same plan fetched twice is parsed once. The cache is bounded;
//! when it grows past `max_entries` the least-recently-used document is
//! evicted.
//!
//! The cache never hands out its own instance: [`ParseCache::get`] returns a
//! clone and [`ParseCache::insert`] takes ownership of a clone made by the
//! caller, so nothing a caller does to its document can reach the cache.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::PlanDocument;

/// Default number of parsed documents kept.
pub const DEFAULT_PARSE_CACHE_SIZE: usize = 50;

/// Operational view of the parse cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CachedPlan {
    document: PlanDocument,
    last_used: u64,
}

/// Bounded LRU map from content fingerprint to parsed document.
///
/// Not synchronized; the parser wraps it in a mutex.
pub struct ParseCache {
    max_entries: usize,
    entries: HashMap<String, CachedPlan>,
    /// Logical clock bumped on every access; orders entries for LRU.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ParseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: HashMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// SHA-256 hex fingerprint of a raw document.
    pub fn fingerprint(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    /// Look up a document; a hit refreshes its recency and returns a clone.
    pub fn get(&mut self, key: &str) -> Option<PlanDocument> {
        self.tick += 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = self.tick;
                self.hits += 1;
                Some(entry.document.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a document, evicting least-recently-used entries beyond the bound.
    ///
    /// A zero-sized cache stores nothing.
    pub fn insert(&mut self, key: String, document: PlanDocument) {
        if self.max_entries == 0 {
            return;
        }
        self.tick += 1;
        self.entries.insert(
            key,
            CachedPlan {
                document,
                last_used: self.tick,
            },
        );
        while self.entries.len() > self.max_entries {
            if !self.evict_lru() {
                break;
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            size: self.entries.len(),
            max_size: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        match oldest {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}
