//! Remote prediction collaborator. Entirely optional: every call falls back
//! to the engine's rule-based score on any failure, so this client never
//! blocks a scan. Health is cached briefly so a down predictor doesn't add
//! latency to every single scan tick.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{AppError, AppResult};
use crate::market::types::PoolInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// The twelve canonical features every prediction request carries, derived
/// straight from a `PoolInfo` -- no additional state. `fee_efficiency_1h` and
/// `volume_to_liquidity` both divide by `max(liquidity, 1)` so an empty pool
/// never produces a division-by-zero or an infinite feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureVector {
    pub volume_30m: f64,
    pub volume_1h: f64,
    pub volume_2h: f64,
    pub volume_4h: f64,
    pub volume_24h: f64,
    pub fees_30m: f64,
    pub fees_1h: f64,
    pub fees_24h: f64,
    pub fee_efficiency_1h: f64,
    pub liquidity: f64,
    pub apr: f64,
    pub volume_to_liquidity: f64,
}

impl FeatureVector {
    pub fn from_pool(pool: &PoolInfo) -> Self {
        let liquidity_floor = pool.liquidity.max(1.0);
        Self {
            volume_30m: pool.volume_30m,
            volume_1h: pool.volume_1h,
            volume_2h: pool.volume_2h,
            volume_4h: pool.volume_4h,
            volume_24h: pool.volume_24h,
            fees_30m: pool.fees_30m,
            fees_1h: pool.fees_1h,
            fees_24h: pool.fees_24h,
            fee_efficiency_1h: pool.fees_1h / liquidity_floor,
            liquidity: pool.liquidity,
            apr: pool.apr,
            volume_to_liquidity: pool.volume_1h / liquidity_floor,
        }
    }

    /// Canonical feature order the wire contract commits to: both sides must
    /// agree on this order independent of field names, since the request
    /// carries bare `f64` arrays rather than named objects.
    pub fn to_array(self) -> [f64; 12] {
        [
            self.volume_30m,
            self.volume_1h,
            self.volume_2h,
            self.volume_4h,
            self.volume_24h,
            self.fees_30m,
            self.fees_1h,
            self.fees_24h,
            self.fee_efficiency_1h,
            self.liquidity,
            self.apr,
            self.volume_to_liquidity,
        ]
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    features: Vec<[f64; 12]>,
    pool_addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub pool_address: String,
    pub probability: f64,
    pub recommendation: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictResponse {
    pub predictions: Vec<Prediction>,
    pub model: String,
    pub threshold: f64,
}

impl PredictResponse {
    pub fn for_pool(&self, pool_address: &str) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.pool_address == pool_address)
    }
}

struct HealthCache {
    healthy: bool,
    checked_at: Instant,
}

pub struct PredictorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    health: Mutex<Option<HealthCache>>,
}

impl PredictorClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            health: Mutex::new(None),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-ML-API-Key", key),
            None => builder,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        if let Some(cached) = self.health.lock().unwrap().as_ref() {
            if cached.checked_at.elapsed() < HEALTH_CACHE_TTL {
                return cached.healthy;
            }
        }

        let url = format!("{}/health", self.base_url);
        let healthy = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);

        *self.health.lock().unwrap() = Some(HealthCache { healthy, checked_at: Instant::now() });
        healthy
    }

    /// Batched prediction across every shortlisted pool in one request: the
    /// request carries one feature row and address per pool, the response
    /// carries one prediction per pool keyed back by `pool_address`. Returns
    /// `None` on any failure (unhealthy, empty input, timeout, bad response)
    /// so the caller falls back to rule-based scoring without special-casing
    /// error types.
    pub async fn predict_batch(&self, pools: &[PoolInfo]) -> Option<PredictResponse> {
        if pools.is_empty() || !self.is_healthy().await {
            return None;
        }

        let url = format!("{}/predict", self.base_url);
        let request = PredictRequest {
            features: pools.iter().map(|p| FeatureVector::from_pool(p).to_array()).collect(),
            pool_addresses: pools.iter().map(|p| p.address.clone()).collect(),
        };
        let response = self.with_auth(self.client.post(&url)).json(&request).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<PredictResponse>().await.ok()
    }

    /// Raw passthrough for `/ml/predict`, `/ml/reload`, `/ml/feedback` --
    /// unlike `predict`, these surface the predictor's own errors to the
    /// caller (an HTTP route) rather than silently falling back, since a
    /// direct API consumer needs to know the request actually failed.
    pub async fn proxy_get(&self, path: &str) -> AppResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(e.to_string()))?;
        self.into_json_or_unavailable(response).await
    }

    pub async fn proxy_post(&self, path: &str, body: serde_json::Value) -> AppResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .with_auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(e.to_string()))?;
        self.into_json_or_unavailable(response).await
    }

    async fn into_json_or_unavailable(&self, response: reqwest::Response) -> AppResult<serde_json::Value> {
        if !response.status().is_success() {
            return Err(AppError::ExternalUnavailable(format!("predictor returned {}", response.status())));
        }
        response.json().await.map_err(|e| AppError::ExternalUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pool() -> PoolInfo {
        PoolInfo {
            address: "pool-1".into(),
            name: "SOL-USDC".into(),
            mint_x: "mintx".into(),
            mint_y: "minty".into(),
            bin_step: 20,
            current_price: 1.0,
            liquidity: 0.0,
            volume_30m: 10.0,
            volume_1h: 20.0,
            volume_2h: 30.0,
            volume_4h: 40.0,
            volume_24h: 500.0,
            fees_30m: 1.0,
            fees_1h: 2.0,
            fees_24h: 10.0,
            apr: 50.0,
            is_blacklisted: false,
        }
    }

    #[test]
    fn test_feature_vector_guards_zero_liquidity() {
        let features = FeatureVector::from_pool(&sample_pool());
        assert!(features.fee_efficiency_1h.is_finite());
        assert!(features.volume_to_liquidity.is_finite());
    }

    #[tokio::test]
    async fn test_unreachable_predictor_reports_unhealthy() {
        let client = PredictorClient::new("http://127.0.0.1:1", None);
        assert!(!client.is_healthy().await);
    }

    #[tokio::test]
    async fn test_predict_batch_falls_back_to_none_when_unhealthy() {
        let client = PredictorClient::new("http://127.0.0.1:1", None);
        assert!(client.predict_batch(&[sample_pool()]).await.is_none());
    }

    #[tokio::test]
    async fn test_predict_batch_rejects_empty_input() {
        let client = PredictorClient::new("http://127.0.0.1:1", None);
        assert!(client.predict_batch(&[]).await.is_none());
    }

    #[test]
    fn test_feature_vector_canonical_order_matches_volume_to_liquidity_fix() {
        let mut pool = sample_pool();
        pool.volume_1h = 20.0;
        pool.volume_24h = 500.0;
        pool.liquidity = 100.0;
        let features = FeatureVector::from_pool(&pool);
        let array = features.to_array();
        // index 11 is volume_to_liquidity; must track volume_1h, not volume_24h.
        assert_eq!(array[11], 20.0 / 100.0);
    }
}
