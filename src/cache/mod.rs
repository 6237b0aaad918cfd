//! Shared market-data cache. Every bot's scan pulls from this cache rather
//! than hitting the upstream pool API directly -- it coalesces concurrent
//! fetches for the same key, rate-limits outbound calls, and serves a stale
//! value on fetch failure rather than propagating the error when one is
//! available. Mirrors the teacher's `feeds` polling loop in spirit, but reworked
//! as a pull-through cache since many bots share one upstream quota here.

use futures_util::future::{FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{AppError, AppResult};
use crate::market::api_client::PoolApiClient;
use crate::market::types::{ActiveBin, PoolInfo};
use crate::retry::{with_backoff, RetryPolicy};

const ALL_POOLS_TTL: Duration = Duration::from_secs(15);
const SINGLE_POOL_TTL: Duration = Duration::from_secs(10);
const ACTIVE_BIN_TTL: Duration = Duration::from_secs(5);
const MIN_CALL_SPACING: Duration = Duration::from_millis(500);

type SharedFetch<T> = Shared<Pin<Box<dyn Future<Output = Result<T, String>> + Send>>>;

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct CacheStats {
    pub all_pools_hits: u64,
    pub all_pools_misses: u64,
    pub single_pool_hits: u64,
    pub single_pool_misses: u64,
    pub active_bin_hits: u64,
    pub active_bin_misses: u64,
    pub stale_served: u64,
}

struct Inner {
    client: Arc<dyn PoolApiClient>,
    all_pools: Mutex<Option<Entry<Vec<PoolInfo>>>>,
    all_pools_inflight: Mutex<Option<SharedFetch<Vec<PoolInfo>>>>,
    single_pool: Mutex<HashMap<String, Entry<PoolInfo>>>,
    single_pool_inflight: Mutex<HashMap<String, SharedFetch<PoolInfo>>>,
    active_bin: Mutex<HashMap<String, Entry<ActiveBin>>>,
    last_call_at: Mutex<Instant>,
    stats: Mutex<CacheStats>,
}

/// Process-wide market-data cache. One instance is shared by every running
/// bot engine; the orchestrator owns the `Arc` and hands clones out.
#[derive(Clone)]
pub struct MarketDataCache {
    inner: Arc<Inner>,
}

impl MarketDataCache {
    pub fn new(client: Arc<dyn PoolApiClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                all_pools: Mutex::new(None),
                all_pools_inflight: Mutex::new(None),
                single_pool: Mutex::new(HashMap::new()),
                single_pool_inflight: Mutex::new(HashMap::new()),
                active_bin: Mutex::new(HashMap::new()),
                last_call_at: Mutex::new(Instant::now() - MIN_CALL_SPACING),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        *self.inner.stats.lock().unwrap()
    }

    pub fn client(&self) -> Arc<dyn PoolApiClient> {
        self.inner.client.clone()
    }

    pub async fn get_all_pools(&self) -> AppResult<Vec<PoolInfo>> {
        if let Some(entry) = self.inner.all_pools.lock().unwrap().as_ref() {
            if entry.fetched_at.elapsed() < ALL_POOLS_TTL {
                self.inner.stats.lock().unwrap().all_pools_hits += 1;
                return Ok(entry.value.clone());
            }
        }
        self.inner.stats.lock().unwrap().all_pools_misses += 1;

        let fetch = {
            let mut inflight = self.inner.all_pools_inflight.lock().unwrap();
            if let Some(existing) = inflight.as_ref() {
                existing.clone()
            } else {
                let inner = self.inner.clone();
                let fut: Pin<Box<dyn Future<Output = Result<Vec<PoolInfo>, String>> + Send>> = Box::pin(async move {
                    inner_rate_limit(&inner).await;
                    let policy = RetryPolicy::default();
                    let client = inner.client.clone();
                    with_backoff(&policy, || {
                        let client = client.clone();
                        async move { client.list_pools().await }
                    })
                    .await
                    .map_err(|e| e.to_string())
                });
                let shared = fut.shared();
                *inflight = Some(shared.clone());
                shared
            }
        };

        let result = fetch.await;
        self.inner.all_pools_inflight.lock().unwrap().take();

        match result {
            Ok(pools) => {
                let now = Instant::now();
                *self.inner.all_pools.lock().unwrap() = Some(Entry { value: pools.clone(), fetched_at: now });
                let mut single = self.inner.single_pool.lock().unwrap();
                for pool in &pools {
                    single.insert(pool.address.clone(), Entry { value: pool.clone(), fetched_at: now });
                }
                Ok(pools)
            }
            Err(msg) => {
                if let Some(entry) = self.inner.all_pools.lock().unwrap().as_ref() {
                    tracing::warn!(error = %msg, "pool list fetch failed, serving stale cache");
                    self.inner.stats.lock().unwrap().stale_served += 1;
                    return Ok(entry.value.clone());
                }
                Err(AppError::ExternalUnavailable(msg))
            }
        }
    }

    pub async fn get_pool(&self, address: &str) -> AppResult<PoolInfo> {
        if let Some(entry) = self.inner.single_pool.lock().unwrap().get(address) {
            if entry.fetched_at.elapsed() < SINGLE_POOL_TTL {
                self.inner.stats.lock().unwrap().single_pool_hits += 1;
                return Ok(entry.value.clone());
            }
        }
        self.inner.stats.lock().unwrap().single_pool_misses += 1;

        let fetch = {
            let mut inflight = self.inner.single_pool_inflight.lock().unwrap();
            if let Some(existing) = inflight.get(address) {
                existing.clone()
            } else {
                let inner = self.inner.clone();
                let addr = address.to_string();
                let fut: Pin<Box<dyn Future<Output = Result<PoolInfo, String>> + Send>> = Box::pin(async move {
                    inner_rate_limit(&inner).await;
                    let policy = RetryPolicy::default();
                    let client = inner.client.clone();
                    with_backoff(&policy, || {
                        let client = client.clone();
                        let addr = addr.clone();
                        async move { client.get_pool(&addr).await }
                    })
                    .await
                    .map_err(|e| e.to_string())
                });
                let shared = fut.shared();
                inflight.insert(address.to_string(), shared.clone());
                shared
            }
        };

        let result = fetch.await;
        self.inner.single_pool_inflight.lock().unwrap().remove(address);

        match result {
            Ok(pool) => {
                self.inner
                    .single_pool
                    .lock()
                    .unwrap()
                    .insert(address.to_string(), Entry { value: pool.clone(), fetched_at: Instant::now() });
                Ok(pool)
            }
            Err(msg) => {
                if let Some(entry) = self.inner.single_pool.lock().unwrap().get(address) {
                    tracing::warn!(error = %msg, %address, "pool fetch failed, serving stale cache");
                    self.inner.stats.lock().unwrap().stale_served += 1;
                    return Ok(entry.value.clone());
                }
                Err(AppError::ExternalUnavailable(msg))
            }
        }
    }

    /// Returns a cached active bin if fresh, else `None` -- callers fall back
    /// to an on-chain read or `synthesize_bin` themselves (see
    /// `market::provider::active_bin`).
    pub fn get_cached_active_bin(&self, address: &str) -> Option<ActiveBin> {
        let bins = self.inner.active_bin.lock().unwrap();
        let entry = bins.get(address)?;
        if entry.fetched_at.elapsed() < ACTIVE_BIN_TTL {
            Some(entry.value)
        } else {
            None
        }
    }

    pub fn cache_active_bin(&self, address: &str, bin: ActiveBin) {
        self.inner
            .active_bin
            .lock()
            .unwrap()
            .insert(address.to_string(), Entry { value: bin, fetched_at: Instant::now() });
    }
}

async fn inner_rate_limit(inner: &Arc<Inner>) {
    let wait = {
        let mut last = inner.last_call_at.lock().unwrap();
        let elapsed = last.elapsed();
        let wait = if elapsed < MIN_CALL_SPACING { MIN_CALL_SPACING - elapsed } else { Duration::ZERO };
        *last = Instant::now() + wait;
        wait
    };
    if wait > Duration::ZERO {
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeClient {
        calls: AtomicU32,
        fail_after: Option<u32>,
    }

    #[async_trait]
    impl PoolApiClient for FakeClient {
        async fn list_pools(&self) -> AppResult<Vec<PoolInfo>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_after) = self.fail_after {
                if n >= fail_after {
                    return Err(AppError::ExternalUnavailable("upstream down".into()));
                }
            }
            Ok(vec![sample_pool("pool-1")])
        }

        async fn get_pool(&self, address: &str) -> AppResult<PoolInfo> {
            Ok(sample_pool(address))
        }

        async fn get_active_bin_onchain(&self, _address: &str) -> AppResult<ActiveBin> {
            Ok(ActiveBin { bin_id: 5, price: 1.0, synthetic: false })
        }
    }

    fn sample_pool(address: &str) -> PoolInfo {
        PoolInfo {
            address: address.to_string(),
            name: "SOL-USDC".into(),
            mint_x: "mintx".into(),
            mint_y: "minty".into(),
            bin_step: 20,
            current_price: 1.0,
            liquidity: 10_000.0,
            volume_30m: 100.0,
            volume_1h: 200.0,
            volume_2h: 300.0,
            volume_4h: 400.0,
            volume_24h: 5_000.0,
            fees_30m: 1.0,
            fees_1h: 2.0,
            fees_24h: 20.0,
            apr: 12.0,
            is_blacklisted: false,
        }
    }

    #[tokio::test]
    async fn test_get_all_pools_populates_single_pool_cache() {
        let client = Arc::new(FakeClient { calls: AtomicU32::new(0), fail_after: None });
        let cache = MarketDataCache::new(client);
        let pools = cache.get_all_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        let single = cache.get_pool("pool-1").await.unwrap();
        assert_eq!(single.address, "pool-1");
        assert_eq!(cache.stats().single_pool_hits, 1);
    }

    #[tokio::test]
    async fn test_stale_served_on_fetch_failure() {
        let client = Arc::new(FakeClient { calls: AtomicU32::new(0), fail_after: Some(1) });
        let cache = MarketDataCache::new(client);
        let _first = cache.get_all_pools().await.unwrap();

        // force expiry by manipulating elapsed time is not possible without
        // mocking Instant; instead simulate a second miss path by clearing
        // the cached entry's freshness through direct field manipulation.
        cache.inner.all_pools.lock().unwrap().as_mut().unwrap().fetched_at =
            Instant::now() - ALL_POOLS_TTL - Duration::from_secs(1);

        let second = cache.get_all_pools().await.unwrap();
        assert_eq!(second[0].address, "pool-1");
        assert_eq!(cache.stats().stale_served, 1);
    }

    #[tokio::test]
    async fn test_coalesces_concurrent_all_pools_fetch() {
        let client = Arc::new(FakeClient { calls: AtomicU32::new(0), fail_after: None });
        let cache = MarketDataCache::new(client.clone());
        let (a, b) = tokio::join!(cache.get_all_pools(), cache.get_all_pools());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
