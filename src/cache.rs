//! Read-through identity cache used by access-token verification.
//!
//! Entries are bounded by count (least recently used goes first) and by age.
//! A hit refreshes the entry's age. The cache is never authoritative: a miss
//! or an expired entry always goes back to the [`IdentitySource`].

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::identity::{Identity, IdentityError, IdentitySource};

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub enum CacheError {
    /// The identity source has no such user
    NotFound,
    /// The identity source failed
    Source(IdentityError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "Identity not found"),
            CacheError::Source(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CacheError {}

struct CacheEntry {
    identity: Identity,
    inserted_at: Instant,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hit_rate: f64,
}

pub struct VerificationCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    identities: Arc<dyn IdentitySource>,
    ttl: Duration,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl VerificationCache {
    pub fn new(identities: Arc<dyn IdentitySource>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            identities,
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a user, reading through to the identity source on a miss.
    pub async fn get(&self, user_id: &str) -> Result<Identity, CacheError> {
        if let Some(identity) = self.lookup(user_id, Instant::now()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(identity);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, "Verification cache miss");

        match self.identities.find_by_id(user_id).await {
            Ok(Some(identity)) => {
                self.set(identity.clone());
                Ok(identity)
            }
            Ok(None) => Err(CacheError::NotFound),
            Err(e) => Err(CacheError::Source(e)),
        }
    }

    /// Fresh entry for `user_id`, refreshing its age. Expired entries are dropped.
    fn lookup(&self, user_id: &str, now: Instant) -> Option<Identity> {
        let mut entries = self.lock();
        let expired = match entries.get_mut(user_id) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                entry.inserted_at = now;
                return Some(entry.identity.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(user_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Insert or replace an entry (login-time warm).
    pub fn set(&self, identity: Identity) {
        let key = identity.id.clone();
        let entry = CacheEntry {
            identity,
            inserted_at: Instant::now(),
        };
        let displaced = self.lock().push(key.clone(), entry);
        self.sets.fetch_add(1, Ordering::Relaxed);

        // `push` also returns the old value when the key was already present
        if let Some((old_key, _)) = displaced {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop one user's entry (logout). Returns whether it was present.
    pub fn evict_one(&self, user_id: &str) -> bool {
        let removed = self.lock().pop(user_id).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry.
    pub fn clear_all(&self) {
        let mut entries = self.lock();
        let count = entries.len() as u64;
        entries.clear();
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let stats = CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity.get(),
            ttl_secs: self.ttl.as_secs(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        };
        crate::metrics::set_cache_stats(&stats);
        stats
    }
}
