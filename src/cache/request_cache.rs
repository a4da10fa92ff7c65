use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::error::{Error, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Outcome<T> = core::result::Result<T, Arc<Error>>;

/// In-flight fetch shared by every caller asking for the same key
#[derive(Debug)]
struct PendingRequest<T> {
    id: u64,
    /// Set by `invalidate`; the result is still delivered but never stored
    discard: bool,
    /// Callers that attached after the first one; only ever grows
    joined: usize,
    outcome: watch::Receiver<Option<Outcome<T>>>,
}

#[derive(Debug)]
struct CacheState<K, T> {
    entries: HashMap<K, CacheEntry<T>>,
    pending: HashMap<K, PendingRequest<T>>,
    next_pending_id: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    deduplicated: AtomicU64,
    stale_served: AtomicU64,
    failures: AtomicU64,
}

/// TTL cache with per-key fetch deduplication and stale-on-error fallback.
///
/// For any key at most one `fetch_fn` runs at a time. Concurrent callers attach
/// to the running fetch and all observe the same value or error.
#[derive(Debug)]
pub struct RequestCache<T, K = CacheKey> {
    state: Arc<RwLock<CacheState<K, T>>>,
    counters: Arc<Counters>,
}

impl<T, K> Clone for RequestCache<T, K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<T, K> Default for RequestCache<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> RequestCache<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_pending_id: 0,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the cached value for `key`, fetching it with `fetch_fn` on a miss.
    ///
    /// A live entry is returned without calling `fetch_fn`. If another caller's
    /// fetch for `key` is in flight, this call waits for that result instead.
    /// Otherwise `fetch_fn` is spawned; its success is stored with `ttl`, and its
    /// failure is answered with the previous (possibly expired) entry if one exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::FetchFailed` if the fetch failed and no previous entry
    /// exists for `key`.
    pub async fn fetch<F, Fut>(&self, key: K, fetch_fn: F, ttl: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let mut outcome_rx = {
            let mut state = self.state.write().await;

            // Re-check under the write lock: a fetch may have landed since the read.
            if let Some(entry) = state.entries.get(&key) {
                if !entry.is_expired() {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
            }

            if let Some(pending) = state.pending.get_mut(&key) {
                pending.joined += 1;
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!("🔗 Cache JOIN: {} ({} joined)", key, pending.joined);
                pending.outcome.clone()
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("❌ Cache MISS: {}", key);

                let (outcome_tx, outcome_rx) = watch::channel(None);
                let id = state.next_pending_id;
                state.next_pending_id += 1;
                state.pending.insert(
                    key.clone(),
                    PendingRequest {
                        id,
                        discard: false,
                        joined: 0,
                        outcome: outcome_rx.clone(),
                    },
                );

                let future = fetch_fn();
                tokio::spawn(Self::complete_fetch(
                    self.state.clone(),
                    self.counters.clone(),
                    key.clone(),
                    id,
                    ttl,
                    future,
                    outcome_tx,
                ));
                outcome_rx
            }
        };

        let outcome = outcome_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|resolved| (*resolved).clone());

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => Err(Error::FetchFailed {
                key: key.to_string(),
                source,
            }),
            None => Err(Error::Custom(format!(
                "fetch task for {key} ended without a result"
            ))),
        }
    }

    /// Runs one fetch to completion and resolves every attached caller.
    async fn complete_fetch<Fut>(
        state: Arc<RwLock<CacheState<K, T>>>,
        counters: Arc<Counters>,
        key: K,
        id: u64,
        ttl: Duration,
        future: Fut,
        outcome_tx: watch::Sender<Option<Outcome<T>>>,
    ) where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let result = AssertUnwindSafe(future).catch_unwind().await.unwrap_or_else(|_| {
            error!("💥 Fetch for {} panicked", key);
            Err(Error::Custom(format!("fetch for {key} panicked")))
        });

        let outcome = {
            let mut state = state.write().await;

            let discard = if state.pending.get(&key).is_some_and(|p| p.id == id) {
                state.pending.remove(&key).is_some_and(|p| p.discard)
            } else {
                true
            };

            match result {
                Ok(value) => {
                    if discard {
                        debug!("🗑️  Cache DISCARD: {} (invalidated while in flight)", key);
                    } else {
                        info!("💾 Cache STORE: {} (TTL: {}s)", key, ttl.as_secs());
                        state
                            .entries
                            .insert(key.clone(), CacheEntry::new(value.clone(), ttl));
                    }
                    Ok(value)
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(previous) = state.entries.get(&key) {
                        counters.stale_served.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "🔄 Fetch failed for {}, serving stale entry ({}s old): {}",
                            key,
                            previous.age().as_secs(),
                            e
                        );
                        Ok(previous.value.clone())
                    } else {
                        warn!("❌ Fetch failed for {} with nothing cached: {}", key, e);
                        Err(Arc::new(e))
                    }
                }
            }
        };

        // Receivers may all be gone if every caller was dropped
        let _ = outcome_tx.send(Some(outcome));
    }

    /// Live entry for `key`, without fetching
    pub async fn get(&self, key: &K) -> Option<T> {
        let state = self.state.read().await;

        match state.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("🎯 Cache HIT: {}", key);
                Some(entry.value.clone())
            }
            Some(_) => {
                debug!("🔄 Cache STALE: {}", key);
                None
            }
            None => None,
        }
    }

    /// Drops the entry for `key`. An in-flight fetch is left running; its callers
    /// still get its result, but the result is not stored.
    pub async fn invalidate(&self, key: &K) {
        let mut state = self.state.write().await;

        let removed = state.entries.remove(key).is_some();
        let in_flight = state.pending.get_mut(key).is_some_and(|pending| {
            pending.discard = true;
            true
        });
        debug!(
            "🔄 INVALIDATE: {} (entry removed: {}, in flight: {})",
            key, removed, in_flight
        );
    }

    /// Removes every entry expired at `now`, returning how many were removed.
    /// Pending requests are not affected.
    pub async fn prune_expired(&self, now: Instant) -> usize {
        let mut state = self.state.write().await;

        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!("🧹 Pruned {} expired entries", removed);
        }
        removed
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let now = Instant::now();

        CacheStats {
            total_entries: state.entries.len(),
            expired_entries: state
                .entries
                .values()
                .filter(|e| e.is_expired_at(now))
                .count(),
            pending_count: state.pending.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Sweeps expired entries every `interval` until `cancel` fires
    #[must_use]
    pub fn spawn_pruner(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("🛑 Cache pruner shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.prune_expired(Instant::now()).await;
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub pending_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub deduplicated: u64,
    pub stale_served: u64,
    pub failures: u64,
}

impl CacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses + self.deduplicated;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
