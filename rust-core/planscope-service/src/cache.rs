// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! Time-bounded result caches.
//!
//! Each cache owns its own mutex, held only for the map access. Values are
//! cloned on the way in and on the way out, so no caller ever shares state
//! with the cache or with another caller. Expired entries are dropped when a
//! lookup finds them and swept on every insert, so keys that are never read
//! again do not pile up.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// A cached value with its insertion time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    /// Visible while `now - inserted_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Map from key to value with a single lifetime for every entry.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A copy of the fresh value under `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(Instant::now()) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a copy of `value`; the last writer wins. Expired entries are
    /// swept first.
    pub fn insert(&self, key: K, value: &V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.is_fresh(now));
        entries.insert(key, CacheEntry::new(value.clone(), self.ttl));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|entry| entry.value)
    }

    /// Drop every entry whose key fails `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.lock().retain(|key, _| keep(key));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Entries held, expired ones included until a lookup or insert drops them.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Identity of a cached plan document. Query and plan hashes are only
/// meaningful within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub connection: String,
    pub query_hash: String,
    pub plan_hash: String,
}

/// A cached plan document with the ids it was fetched under.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPlanXml {
    pub xml: String,
    pub query_id: Option<i64>,
    pub plan_id: Option<i64>,
}

#[derive(Default)]
struct PlanXmlState {
    entries: HashMap<PlanKey, CacheEntry<CachedPlanXml>>,
    /// `(connection, query id)` to the newest key stored under it.
    by_query_id: HashMap<(String, i64), PlanKey>,
}

impl PlanXmlState {
    fn remove(&mut self, key: &PlanKey) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(id) = entry.value.query_id {
                let index_key = (key.connection.clone(), id);
                if self.by_query_id.get(&index_key) == Some(key) {
                    self.by_query_id.remove(&index_key);
                }
            }
        }
    }
}

/// Plan documents keyed by `(connection, query hash, plan hash)`, with a
/// secondary index from `(connection, query id)`. Both maps change together
/// under one lock.
pub struct PlanXmlCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<PlanXmlState>,
}

impl PlanXmlCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            state: Mutex::new(PlanXmlState::default()),
        }
    }

    /// Look up by query id through the secondary index.
    pub fn get_by_query_id(&self, connection: &str, query_id: i64) -> Option<CachedPlanXml> {
        let mut state = self.state.lock();
        let key = state
            .by_query_id
            .get(&(connection.to_string(), query_id))?
            .clone();
        Self::fresh(&mut state, &key)
    }

    /// Look up the most recently stored plan of a query hash.
    pub fn get_by_query_hash(&self, connection: &str, query_hash: &str) -> Option<CachedPlanXml> {
        let mut state = self.state.lock();
        let key = state
            .entries
            .iter()
            .filter(|(key, _)| {
                key.connection == connection && key.query_hash.eq_ignore_ascii_case(query_hash)
            })
            .max_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone())?;
        Self::fresh(&mut state, &key)
    }

    pub fn get(&self, key: &PlanKey) -> Option<CachedPlanXml> {
        let mut state = self.state.lock();
        Self::fresh(&mut state, key)
    }

    fn fresh(state: &mut PlanXmlState, key: &PlanKey) -> Option<CachedPlanXml> {
        let entry = state.entries.get(key)?;
        if entry.is_fresh(Instant::now()) {
            return Some(entry.value.clone());
        }
        state.remove(key);
        None
    }

    /// Store a document, dropping the oldest entries beyond the bound.
    pub fn insert(&self, key: PlanKey, value: &CachedPlanXml) {
        if self.max_entries == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.remove(&key);
        if let Some(id) = value.query_id {
            state
                .by_query_id
                .insert((key.connection.clone(), id), key.clone());
        }
        state
            .entries
            .insert(key, CacheEntry::new(value.clone(), self.ttl));

        while state.entries.len() > self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => state.remove(&key),
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.by_query_id.clear();
    }

    /// Drop every document fetched over `connection`.
    pub fn remove_connection(&self, connection: &str) {
        let mut state = self.state.lock();
        state.entries.retain(|key, _| key.connection != connection);
        state.by_query_id.retain(|(conn, _), _| conn != connection);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Number of query ids in the secondary index.
    pub fn indexed_ids(&self) -> usize {
        self.state.lock().by_query_id.len()
    }
}
