//! Stampede-safe query result cache.
//!
//! A bounded LRU map of fused results plus a map of in-flight markers, both
//! behind one mutex that is only held for map mutations, never while a
//! result is being computed.
//!
//! Single-flight: the first caller for an uncached key becomes the leader
//! ([`QueryCache::begin_inflight`] returns `true`) and computes; everyone
//! else waits on a per-key `watch` channel with a bounded timeout
//! ([`QueryCache::wait_inflight`]). The leader's marker is removed by an
//! RAII guard, so a failed, panicking or cancelled leader still wakes its
//! followers. A follower that times out computes once on its own.
//!
//! Results computed while a stage was down are kept only for the short
//! `degraded_ttl`, so a recovered Stage 1 is seen again within seconds.
//!
//! Keys carry a namespace derived from the active index generation and the
//! retrieval-config fingerprint. Entries written under one namespace are
//! unreachable from any other, so a reindex or a policy change invalidates
//! the cache without touching it.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use coderank_core::models::RetrievalResult;

use crate::config::CacheConfig;
use crate::metrics::ratio;
use crate::error::RetrievalError;
use crate::retriever::{Retrieved, SearchMode};

/// Upper bound on how long a degraded result is served from cache.
const DEFAULT_DEGRADED_TTL: Duration = Duration::from_secs(5);

/// Cache namespace for a generation and retrieval-config fingerprint.
pub fn namespace(generation: u64, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_le_bytes());
    hasher.update(fingerprint.as_bytes());
    hex::encode(&hasher.finalize()[..12])
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub mode: SearchMode,
    pub top_k: usize,
    pub namespace: String,
}

impl CacheKey {
    pub fn new(query: &str, mode: SearchMode, top_k: usize, namespace: &str) -> Self {
        Self {
            query: query.to_string(),
            mode,
            top_k,
            namespace: namespace.to_string(),
        }
    }
}

struct Entry {
    results: Vec<RetrievalResult>,
    created_at: Instant,
    ttl: Duration,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    inflight: HashMap<CacheKey, watch::Sender<bool>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub inflight: usize,
    pub joined: u64,
    pub follower_timeouts: u64,
}

pub struct QueryCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    degraded_ttl: Duration,
    inflight_wait: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    follower_timeouts: AtomicU64,
}

/// Ends a leader's in-flight marker however the leader exits.
struct InflightGuard<'a> {
    cache: &'a QueryCache,
    key: &'a CacheKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache.end_inflight(self.key);
    }
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration, inflight_wait: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                inflight: HashMap::new(),
            }),
            ttl,
            degraded_ttl: ttl.min(DEFAULT_DEGRADED_TTL),
            inflight_wait,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            follower_timeouts: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl(), config.inflight_wait())
            .with_degraded_ttl(config.degraded_ttl())
    }

    /// Lifetime of results that were computed with a stage missing.
    pub fn with_degraded_ttl(mut self, ttl: Duration) -> Self {
        self.degraded_ttl = ttl.min(self.ttl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Vec<RetrievalResult>> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < entry.ttl => {
                return Some(entry.results.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
        }
        None
    }

    /// Cached results for `key`; expired entries are removed and count as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<RetrievalResult>> {
        let found = self.lookup(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store `results`, evicting the least recently used entry when full.
    pub fn set(&self, key: CacheKey, results: Vec<RetrievalResult>) {
        self.insert(key, results, self.ttl);
    }

    fn insert(&self, key: CacheKey, results: Vec<RetrievalResult>, ttl: Duration) {
        let mut inner = self.lock();
        inner.entries.put(
            key,
            Entry {
                results,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    fn store(&self, key: &CacheKey, retrieved: Retrieved) -> Vec<RetrievalResult> {
        let ttl = if retrieved.degraded {
            self.degraded_ttl
        } else {
            self.ttl
        };
        self.insert(key.clone(), retrieved.results.clone(), ttl);
        retrieved.results
    }

    /// Claim leadership for `key`. `true` for exactly one caller until
    /// [`end_inflight`](Self::end_inflight).
    pub fn begin_inflight(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        if inner.inflight.contains_key(key) {
            return false;
        }
        let (tx, _rx) = watch::channel(false);
        inner.inflight.insert(key.clone(), tx);
        true
    }

    /// Remove the marker for `key` and wake every follower.
    pub fn end_inflight(&self, key: &CacheKey) {
        let sender = self.lock().inflight.remove(key);
        if let Some(tx) = sender {
            tx.send_replace(true);
        }
    }

    /// Wait for the leader of `key` to finish. `false` on timeout.
    ///
    /// Returns `true` immediately when no leader is in flight.
    pub async fn wait_inflight(&self, key: &CacheKey, timeout: Duration) -> bool {
        let mut rx = match self.lock().inflight.get(key) {
            Some(tx) => tx.subscribe(),
            None => return true,
        };
        // A dropped sender also means the leader is gone.
        tokio::time::timeout(timeout, rx.changed()).await.is_ok()
    }

    /// Cached results for `key`, computing them at most once across
    /// concurrent callers.
    ///
    /// Errors from `compute` are returned to the caller that ran it and are
    /// never cached. Degraded results are cached for `degraded_ttl` only.
    pub async fn get_or_compute<F, Fut, T, E>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<Vec<RetrievalResult>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Into<Retrieved>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        if self.begin_inflight(key) {
            let _guard = InflightGuard { cache: self, key };
            let retrieved = compute().await?.into();
            return Ok(self.store(key, retrieved));
        }

        if self.wait_inflight(key, self.inflight_wait).await {
            if let Some(shared) = self.lookup(key) {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(query = %key.query, "joined in-flight computation");
                return Ok(shared);
            }
        } else {
            self.follower_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                query = %key.query,
                wait_ms = self.inflight_wait.as_millis() as u64,
                error = %RetrievalError::CacheTimeout,
                "computing independently"
            );
        }

        let retrieved = compute().await?.into();
        Ok(self.store(key, retrieved))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inflight_count(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let (size, inflight) = {
            let inner = self.lock();
            (inner.entries.len(), inner.inflight.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            hit_rate: ratio(hits, hits + misses),
            size,
            inflight,
            joined: self.joined.load(Ordering::Relaxed),
            follower_timeouts: self.follower_timeouts.load(Ordering::Relaxed),
        }
    }
}
