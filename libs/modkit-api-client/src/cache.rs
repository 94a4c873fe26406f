//! Bounded response cache with per-entry expiry and pattern invalidation.
//!
//! Entries are owned `serde_json::Value`s: `set` stores a deep copy and `get`
//! hands out a deep copy, so callers never share state with the cache.
//! Eviction is by insertion order (oldest first), not by access recency.
//! Expired entries are dropped lazily when read.

use crate::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    /// Stored from a non-JSON body; served back as raw text
    text: bool,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order; a key appears once, at the position of its first insert
    order: VecDeque<String>,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Response cache shared by every endpoint of one client.
#[derive(Debug)]
pub struct CacheManager {
    state: Mutex<CacheState>,
    capacity: usize,
    default_ttl: Duration,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl CacheManager {
    /// Create a cache holding at most `capacity` entries (clamped to at least 1).
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store a copy of `data` under `key`, expiring after `ttl` (or the default TTL).
    ///
    /// Overwriting an existing key keeps its insertion position. Inserting a
    /// new key into a full cache evicts the oldest-inserted entry first.
    pub fn set(&self, key: impl Into<String>, data: &Value, ttl: Option<Duration>) {
        self.insert(key.into(), data.clone(), false, ttl);
    }

    /// Store a response body that did not decode as JSON.
    ///
    /// `get` sees it as a string value; a cache hit replays it as raw text.
    pub(crate) fn set_text(&self, key: impl Into<String>, text: String, ttl: Option<Duration>) {
        self.insert(key.into(), Value::String(text), true, ttl);
    }

    fn insert(&self, key: String, data: Value, text: bool, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            data,
            text,
            expires_at: Instant::now() + ttl,
        };

        let mut state = self.state.lock();
        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.capacity {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
                tracing::trace!(key = %oldest, "evicted oldest cache entry");
            }
            state.order.push_back(key.clone());
        }
        state.entries.insert(key, entry);
    }

    /// Copy of the value under `key`, or `None` if absent or expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|(data, _)| data)
    }

    /// Like `get`, plus whether the entry was stored as raw text.
    pub(crate) fn get_entry(&self, key: &str) -> Option<(Value, bool)> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.remove(key);
                tracing::trace!(key, "cache entry expired");
                None
            }
            Some(entry) => Some((entry.data.clone(), entry.text)),
            None => None,
        }
    }

    /// Typed read; a value that does not deserialize into `T` is treated as a miss.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached value has unexpected shape");
                None
            }
        }
    }

    /// True if `key` holds an unexpired entry.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`; returns whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key)
    }

    /// Delete every key that contains any pattern as a substring, or fully
    /// matches any pattern read as a wildcard expression (`*` = any sequence).
    ///
    /// Returns the number of removed entries.
    pub fn invalidate<I, S>(&self, patterns: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers: Vec<PatternMatcher> = patterns
            .into_iter()
            .map(|p| PatternMatcher::new(p.as_ref()))
            .collect();
        if matchers.is_empty() {
            return 0;
        }

        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|key| matchers.iter().any(|m| m.matches(key)))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        if !doomed.is_empty() {
            tracing::debug!(removed = doomed.len(), "invalidated cache entries");
        }
        doomed.len()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Number of stored entries, including expired ones not yet read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().order.iter().cloned().collect()
    }
}

struct PatternMatcher {
    literal: String,
    wildcard: Option<Regex>,
}

impl PatternMatcher {
    fn new(pattern: &str) -> Self {
        let wildcard = if pattern.contains('*') {
            let expr = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
            Regex::new(&expr).ok()
        } else {
            None
        };
        Self {
            literal: pattern.to_owned(),
            wildcard,
        }
    }

    fn matches(&self, key: &str) -> bool {
        key.contains(&self.literal) || self.wildcard.as_ref().is_some_and(|re| re.is_match(key))
    }
}
