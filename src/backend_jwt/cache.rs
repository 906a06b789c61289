//! Issued backend tokens, reused per API and caller credential.
//!
//! The cache is bounded: once full, new tokens are still issued but not kept
//! until a sweep frees room. Expired entries are only removed by
//! [`TokenCache::purge_expired`], which runs off the request path.

use dashmap::DashMap;

/// Tokens are not handed out when they expire within this many seconds.
const EXPIRY_MARGIN_SECS: i64 = 15;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

impl CachedToken {
    fn usable_at(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_MARGIN_SECS > now
    }
}

/// Cache keyed by `context:version:credential-signature`.
#[derive(Debug)]
pub struct TokenCache {
    entries: DashMap<String, CachedToken>,
    capacity: usize,
}

impl TokenCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn key(context: &str, version: &str, signature: &str) -> String {
        format!("{context}:{version}:{signature}")
    }

    /// Token for `key` unless it expires within the margin.
    pub fn get(&self, key: &str, now: i64) -> Option<String> {
        let entry = self.entries.get(key)?;
        entry.usable_at(now).then(|| entry.token.clone())
    }

    /// Keep `token` under `key`. Returns false when the cache is full and the key is new.
    pub fn insert(&self, key: String, token: String, expires_at: i64) -> bool {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, CachedToken { token, expires_at });
        true
    }

    /// Drop tokens no longer handed out. Returns how many were removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.usable_at(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
