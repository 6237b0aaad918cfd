pub mod api_client;
pub mod types;

use std::sync::Arc;

use crate::cache::MarketDataCache;
use crate::errors::AppResult;
use crate::market::api_client::PoolApiClient;
use crate::market::types::{synthesize_bin, ActiveBin, MarketScore, PoolInfo, ScoreClassification, WRAPPED_SOL_MINT};

/// Per-bot eligibility filters evaluated against the shared pool universe.
/// Each bot config carries one of these; the provider never persists them.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    pub sol_pairs_only: bool,
    pub blacklisted_mints: Vec<String>,
    pub min_volume_24h: f64,
    pub min_liquidity: f64,
    pub max_liquidity: f64,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self {
            sol_pairs_only: true,
            blacklisted_mints: Vec::new(),
            min_volume_24h: 0.0,
            min_liquidity: 0.0,
            max_liquidity: f64::MAX,
        }
    }
}

const WEIGHT_VOLUME: f64 = 0.35;
const WEIGHT_LIQUIDITY: f64 = 0.20;
const WEIGHT_FEE_EFFICIENCY: f64 = 0.25;
const WEIGHT_MOMENTUM: f64 = 0.20;

// The weighted sum above maxes at 100 (weights sum to 1.0); doubling it is
// meant to land the admission threshold in a "150" regime, so the clamp and
// thresholds below both operate on the doubled 0-200 scale, not 0-100.
const ENTER_THRESHOLD: f64 = 140.0;
const WAIT_THRESHOLD: f64 = 80.0;

/// Front door for everything market-data related. Bots never talk to the
/// cache or the API client directly -- they go through this provider so the
/// eligibility and scoring rules live in exactly one place.
#[derive(Clone)]
pub struct MarketDataProvider {
    cache: MarketDataCache,
}

impl MarketDataProvider {
    pub fn new(client: Arc<dyn PoolApiClient>) -> Self {
        Self { cache: MarketDataCache::new(client) }
    }

    pub fn with_cache(cache: MarketDataCache) -> Self {
        Self { cache }
    }

    pub async fn list_eligible_pools(&self, filter: &EligibilityFilter) -> AppResult<Vec<PoolInfo>> {
        let pools = self.cache.get_all_pools().await?;
        Ok(pools.into_iter().filter(|pool| pool_is_eligible(pool, filter)).collect())
    }

    pub fn market_score(&self, pool: &PoolInfo) -> MarketScore {
        let volume_score = score_volume(pool.volume_24h);
        let liquidity_score = score_liquidity(pool.liquidity);
        let fee_score = score_fee_efficiency(pool.fees_24h, pool.liquidity);
        let momentum_score = score_momentum(pool.apr);

        let total = ((volume_score * WEIGHT_VOLUME)
            + (liquidity_score * WEIGHT_LIQUIDITY)
            + (fee_score * WEIGHT_FEE_EFFICIENCY)
            + (momentum_score * WEIGHT_MOMENTUM))
            * 2.0;
        let total = total.clamp(0.0, 200.0);

        let classification = if total >= ENTER_THRESHOLD {
            ScoreClassification::Enter
        } else if total >= WAIT_THRESHOLD {
            ScoreClassification::Wait
        } else {
            ScoreClassification::Skip
        };

        MarketScore { total, classification }
    }

    /// Cache-first active bin lookup: a fresh cached bin wins, otherwise an
    /// on-chain read is attempted, falling back to the synthetic formula if
    /// that read fails. Synthesized bins are cached exactly like real ones so
    /// a flaky RPC endpoint doesn't force every scan back onto the formula.
    pub async fn active_bin(&self, pool: &PoolInfo) -> ActiveBin {
        if let Some(cached) = self.cache.get_cached_active_bin(&pool.address) {
            return cached;
        }

        let client = self.cache.client();
        let bin = match client.get_active_bin_onchain(&pool.address).await {
            Ok(bin) => bin,
            Err(err) => {
                tracing::warn!(error = %err, address = %pool.address, "active bin read failed, synthesizing from price");
                synthesize_bin(pool.current_price, pool.bin_step)
            }
        };

        self.cache.cache_active_bin(&pool.address, bin);
        bin
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }
}

fn pool_is_eligible(pool: &PoolInfo, filter: &EligibilityFilter) -> bool {
    if pool.is_blacklisted {
        return false;
    }
    if filter.sol_pairs_only && pool.mint_x != WRAPPED_SOL_MINT && pool.mint_y != WRAPPED_SOL_MINT {
        return false;
    }
    if filter.blacklisted_mints.iter().any(|m| m == &pool.mint_x || m == &pool.mint_y) {
        return false;
    }
    if pool.volume_24h < filter.min_volume_24h {
        return false;
    }
    if pool.liquidity < filter.min_liquidity || pool.liquidity > filter.max_liquidity {
        return false;
    }
    true
}

fn score_volume(volume_24h: f64) -> f64 {
    (volume_24h / 100_000.0 * 100.0).clamp(0.0, 100.0)
}

fn score_liquidity(liquidity: f64) -> f64 {
    (liquidity / 50_000.0 * 100.0).clamp(0.0, 100.0)
}

fn score_fee_efficiency(fees_24h: f64, liquidity: f64) -> f64 {
    let denom = liquidity.max(1.0);
    ((fees_24h / denom) * 10_000.0).clamp(0.0, 100.0)
}

fn score_momentum(apr: f64) -> f64 {
    (apr / 2.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pool() -> PoolInfo {
        PoolInfo {
            address: "pool-1".into(),
            name: "SOL-USDC".into(),
            mint_x: WRAPPED_SOL_MINT.into(),
            mint_y: "usdc-mint".into(),
            bin_step: 20,
            current_price: 150.0,
            liquidity: 40_000.0,
            volume_30m: 1_000.0,
            volume_1h: 2_000.0,
            volume_2h: 3_000.0,
            volume_4h: 5_000.0,
            volume_24h: 80_000.0,
            fees_30m: 10.0,
            fees_1h: 20.0,
            fees_24h: 400.0,
            apr: 150.0,
            is_blacklisted: false,
        }
    }

    #[test]
    fn test_eligibility_rejects_blacklisted_pool() {
        let mut pool = sample_pool();
        pool.is_blacklisted = true;
        let filter = EligibilityFilter::default();
        assert!(!pool_is_eligible(&pool, &filter));
    }

    #[test]
    fn test_eligibility_requires_sol_pair_when_configured() {
        let mut pool = sample_pool();
        pool.mint_x = "not-sol".into();
        pool.mint_y = "also-not-sol".into();
        let filter = EligibilityFilter { sol_pairs_only: true, ..Default::default() };
        assert!(!pool_is_eligible(&pool, &filter));
    }

    #[test]
    fn test_eligibility_honors_liquidity_bounds() {
        let pool = sample_pool();
        let filter = EligibilityFilter { min_liquidity: 50_000.0, ..Default::default() };
        assert!(!pool_is_eligible(&pool, &filter));
    }

    #[test]
    fn test_market_score_classifies_strong_pool_as_enter() {
        let provider = MarketDataProvider::with_cache(MarketDataCache::new(Arc::new(NoopClient)));
        let score = provider.market_score(&sample_pool());
        assert_eq!(score.classification, ScoreClassification::Enter);
    }

    #[test]
    fn test_market_score_classifies_thin_pool_as_skip() {
        let provider = MarketDataProvider::with_cache(MarketDataCache::new(Arc::new(NoopClient)));
        let mut pool = sample_pool();
        pool.volume_24h = 0.0;
        pool.liquidity = 10.0;
        pool.fees_24h = 0.0;
        pool.apr = 0.0;
        let score = provider.market_score(&pool);
        assert_eq!(score.classification, ScoreClassification::Skip);
    }

    struct NoopClient;

    #[async_trait::async_trait]
    impl PoolApiClient for NoopClient {
        async fn list_pools(&self) -> AppResult<Vec<PoolInfo>> {
            Ok(Vec::new())
        }
        async fn get_pool(&self, address: &str) -> AppResult<PoolInfo> {
            Err(crate::errors::AppError::NotFound(address.to_string()))
        }
        async fn get_active_bin_onchain(&self, _address: &str) -> AppResult<ActiveBin> {
            Err(crate::errors::AppError::ExternalUnavailable("noop".into()))
        }
    }
}
