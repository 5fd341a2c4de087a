// In-memory payload cache with per-key single-flight fetching.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::FetchError;

type FlightResult = Option<Result<CacheEntry, FetchError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    /// Wall-clock capture time, for reporting.
    pub fetched_at: DateTime<Utc>,
    stored_at: Instant,
}

impl CacheEntry {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            fetched_at: Utc::now(),
            stored_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    /// Payload as JSON: embedded as-is when it parses, otherwise as a string.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.payload).into_owned())
        })
    }
}

/// How a `get_or_fetch` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Fresh entry already present.
    Hit,
    /// This caller ran the fetch.
    Miss,
    /// This caller waited on another caller's fetch.
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: CacheEntry,
    pub status: CacheStatus,
}

impl CacheLookup {
    /// True when no upstream fetch ran on this caller's behalf.
    pub fn from_cache(&self) -> bool {
        self.status == CacheStatus::Hit
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub hit_rate: f64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, watch::Receiver<FlightResult>>,
}

pub struct ResponseCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    stale_retention: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            default_ttl: config.ttl(),
            stale_retention: config.stale_retention().max(config.ttl()),
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the entry for `key`, running `fetch` at most once per key at a time.
    ///
    /// A fresh entry (younger than `ttl`) is returned unless `force_refresh`.
    /// Otherwise the caller either joins a fetch already in flight for `key`
    /// or runs `fetch` itself and publishes the outcome to everyone waiting.
    /// Joiners observe a failed fetch as [`FetchError::CacheFetchFailed`];
    /// failures are never cached. If the running caller is cancelled, one
    /// of the joiners takes over.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        force_refresh: bool,
        fetch: F,
    ) -> Result<CacheLookup, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, FetchError>>,
    {
        let tx = loop {
            let mut rx = {
                let mut state = self.state.lock();
                if !force_refresh {
                    if let Some(entry) = state.entries.get(key).filter(|e| e.is_fresh(ttl)) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(CacheLookup {
                            entry: entry.clone(),
                            status: CacheStatus::Hit,
                        });
                    }
                }
                match state.in_flight.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.in_flight.insert(key.to_string(), rx);
                        break tx;
                    }
                }
            };

            debug!("joining in-flight fetch for {}", key);
            let outcome = match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };
            match outcome {
                Some(Ok(entry)) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheLookup {
                        entry,
                        status: CacheStatus::Coalesced,
                    });
                }
                Some(Err(e)) => return Err(e),
                // The fetching caller went away without publishing; race for the slot again.
                None => debug!("in-flight fetch for {} abandoned, retrying", key),
            }
        };

        let flight = Flight {
            cache: self,
            key,
            tx: Some(tx),
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = fetch().await.map(CacheEntry::new);
        flight.complete(result).map(|entry| CacheLookup {
            entry,
            status: CacheStatus::Miss,
        })
    }

    /// Fresh entry for `key`, without fetching.
    pub fn peek(&self, key: &str, ttl: Duration) -> Option<CacheEntry> {
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|e| e.is_fresh(ttl))
            .cloned()
    }

    /// Entry for `key` of any age still within the stale retention window.
    pub fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|e| e.age() < self.stale_retention)
            .cloned()
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Drop entries older than the stale retention window. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        let retention = self.stale_retention;
        state.entries.retain(|_, e| e.age() < retention);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!("purged {} expired cache entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, in_flight) = {
            let state = self.state.lock();
            (state.entries.len(), state.in_flight.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let coalesced = self.coalesced.load(Ordering::Relaxed);
        let lookups = hits + misses + coalesced;
        CacheStats {
            entries,
            in_flight,
            hits,
            misses,
            coalesced,
            failures: self.failures.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                (hits + coalesced) as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    fn evict_oldest_locked(&self, state: &mut CacheState) {
        while state.entries.len() > self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!("evicting cache entry {}", key);
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// The in-flight marker owned by the caller running a fetch. Dropping it
/// unpublished (cancellation) clears the marker so joiners can retry.
struct Flight<'a> {
    cache: &'a ResponseCache,
    key: &'a str,
    tx: Option<watch::Sender<FlightResult>>,
}

impl Flight<'_> {
    fn complete(
        mut self,
        result: Result<CacheEntry, FetchError>,
    ) -> Result<CacheEntry, FetchError> {
        {
            let mut state = self.cache.state.lock();
            // The entry becomes visible before the marker goes away.
            if let Ok(entry) = &result {
                state.entries.insert(self.key.to_string(), entry.clone());
                self.cache.evict_oldest_locked(&mut state);
            }
            state.in_flight.remove(self.key);
        }
        if let Err(e) = &result {
            self.cache.failures.fetch_add(1, Ordering::Relaxed);
            warn!("fetch for {} failed: {}", self.key, e);
        }
        if let Some(tx) = self.tx.take() {
            let shared = result
                .clone()
                .map_err(|e| FetchError::CacheFetchFailed(Box::new(e)));
            tx.send_replace(Some(shared));
        }
        result
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.cache.state.lock().in_flight.remove(self.key);
            drop(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    fn cache() -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(&CacheConfig {
            ttl_secs: 60,
            stale_retention_secs: 600,
            max_entries: 100,
        }))
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        payload: &'static str,
    ) -> impl Future<Output = Result<Bytes, FetchError>> {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Bytes::from_static(payload.as_bytes()))
        }
    }

    #[test]
    fn test_payload_json_embeds_or_wraps() {
        let json = CacheEntry::new(Bytes::from_static(br#"{"price": 10}"#));
        assert_eq!(json.payload_json()["price"], 10);
        let html = CacheEntry::new(Bytes::from_static(b"<html></html>"));
        assert_eq!(html.payload_json(), serde_json::json!("<html></html>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "a"))
            .await
            .unwrap();
        assert_eq!(first.status, CacheStatus::Miss);

        let second = cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "b"))
            .await
            .unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.entry.payload, Bytes::from_static(b"a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "a"))
            .await
            .unwrap();

        tokio::time::advance(TTL).await;
        assert!(cache.peek("e1", TTL).is_none());
        let again = cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "b"))
            .await
            .unwrap();
        assert_eq!(again.status, CacheStatus::Miss);
        assert_eq!(again.entry.payload, Bytes::from_static(b"b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_hits() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let r = cache
                .get_or_fetch("e1", Duration::ZERO, false, || counting_fetch(&calls, "a"))
                .await
                .unwrap();
            assert_eq!(r.status, CacheStatus::Miss);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_bypasses_fresh_entry() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "old"))
            .await
            .unwrap();
        let r = cache
            .get_or_fetch("e1", TTL, true, || counting_fetch(&calls, "new"))
            .await
            .unwrap();
        assert_eq!(r.status, CacheStatus::Miss);
        assert_eq!(cache.peek("e1", TTL).unwrap().payload, Bytes::from_static(b"new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            // Force-refresh callers join the in-flight fetch too.
            let force = i % 3 == 0;
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("e1", TTL, force, || counting_fetch(&calls, "shared"))
                    .await
            }));
        }

        let mut misses = 0;
        let mut coalesced = 0;
        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert_eq!(r.entry.payload, Bytes::from_static(b"shared"));
            match r.status {
                CacheStatus::Miss => misses += 1,
                CacheStatus::Coalesced => coalesced += 1,
                CacheStatus::Hit => {}
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(misses, 1);
        assert_eq!(coalesced, 9);
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().coalesced, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_shared_and_not_cached() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err::<Bytes, _>(FetchError::DetectionSuspected("blocked".into()))
            }
        };

        let leader = {
            let cache = cache.clone();
            let failing = failing.clone();
            tokio::spawn(async move { cache.get_or_fetch("e1", TTL, false, failing).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_fetch("e1", TTL, false, failing).await })
        };

        let leader_err = leader.await.unwrap().unwrap_err();
        let follower_err = follower.await.unwrap().unwrap_err();
        assert_eq!(leader_err, FetchError::DetectionSuspected("blocked".into()));
        assert_eq!(
            follower_err,
            FetchError::CacheFetchFailed(Box::new(FetchError::DetectionSuspected(
                "blocked".into()
            )))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().failures, 1);

        let ok = cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "later"))
            .await
            .unwrap();
        assert_eq!(ok.status, CacheStatus::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetcher_hands_over() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("e1", TTL, false, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Bytes::from_static(b"never"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.in_flight(), 1);

        let follower = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "takeover"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let r = follower.await.unwrap().unwrap();
        assert_eq!(r.status, CacheStatus::Miss);
        assert_eq!(r.entry.payload, Bytes::from_static(b"takeover"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_kept_until_retention() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_fetch("e1", TTL, false, || counting_fetch(&calls, "a"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.peek("e1", TTL).is_none());
        assert!(cache.get_stale("e1").is_some());
        assert_eq!(cache.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(cache.get_stale("e1").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_entry_evicted_over_capacity() {
        let cache = ResponseCache::new(&CacheConfig {
            ttl_secs: 60,
            stale_retention_secs: 600,
            max_entries: 2,
        });
        for key in ["a", "b", "c"] {
            cache
                .get_or_fetch(key, TTL, false, || async { Ok(Bytes::from_static(b"x")) })
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.cached_keys(), vec!["b".to_string(), "c".to_string()]);
    }
}
