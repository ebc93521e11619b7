use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{ResponsePayload, UserProfile};

/// Stable key derived from the normalized query and the serialized profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(query: &str, profile: Option<&UserProfile>) -> Self {
        let profile = profile
            .map(|p| p.to_string())
            .unwrap_or_else(|| "null".to_string());
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());
        // unit separator keeps "ab"+"c" and "a"+"bc" apart
        hasher.update([0x1f]);
        hasher.update(profile.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the short prefix is plenty for log lines
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Lower-cases and trims, so trivially different spellings share an entry.
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: ResponsePayload,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Exact-match response cache keyed by request fingerprint.
///
/// Entries expire `ttl` after insertion. Expired entries are removed lazily on
/// `get` and by the periodic sweep. When full, the least recently accessed
/// entry is evicted.
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached payload, counting a hit. Expired entries are deleted
    /// and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ResponsePayload> {
        let now = Instant::now();
        let found = match self.entries.get_mut(fingerprint) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                entry.last_accessed = now;
                log::debug!(
                    "Cache hit for {} (hit #{}, age {:?})",
                    fingerprint,
                    entry.hit_count,
                    now - entry.created_at
                );
                Some(entry.payload.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match found {
            Some(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            None => {
                log::debug!("Cache entry {} expired, evicting", fingerprint);
                self.entries.remove_if(fingerprint, |_, entry| entry.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a live entry exists, without touching hit statistics.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        self.entries
            .get(fingerprint)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    pub fn put(&self, fingerprint: Fingerprint, payload: ResponsePayload, ttl: Duration) {
        let now = Instant::now();
        if !self.entries.contains_key(&fingerprint) && self.entries.len() >= self.max_entries {
            self.evict_one();
        }
        log::debug!("Caching response {} for {:?}", fingerprint, ttl);
        self.entries.insert(
            fingerprint,
            CacheEntry {
                payload,
                created_at: now,
                expires_at: now + ttl,
                last_accessed: now,
                hit_count: 0,
            },
        );
    }

    /// Hit count of a live entry.
    pub fn hit_count(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.entries.get(fingerprint).map(|entry| entry.hit_count)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            log::debug!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Runs `sweep_expired` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    log::debug!("Cache dropped, stopping sweeper");
                    break;
                };
                cache.sweep_expired();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    // Expired entries go first, otherwise the least recently accessed one.
    fn evict_one(&self) {
        if self.sweep_expired() > 0 {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            log::debug!("Cache full ({} entries), evicting {}", self.max_entries, key);
            self.entries.remove(&key);
        }
    }
}
