//! Upstream pool API client. This is the "pool universe" collaborator the
//! shared cache fronts -- out of scope per spec.md Section 1 beyond its
//! contract, so only the shape the cache and provider need is modelled here.

use crate::errors::{AppError, AppResult};
use crate::market::types::{ActiveBin, PoolInfo};
use async_trait::async_trait;
use reqwest::Client;

#[async_trait]
pub trait PoolApiClient: Send + Sync {
    async fn list_pools(&self) -> AppResult<Vec<PoolInfo>>;
    async fn get_pool(&self, address: &str) -> AppResult<PoolInfo>;
    /// On-chain active bin read through the DLMM SDK. Fails (rather than
    /// synthesising) so the caller can decide on fallback -- see
    /// `market::provider::active_bin`.
    async fn get_active_bin_onchain(&self, address: &str) -> AppResult<ActiveBin>;
}

/// Production client. Talks to the upstream pool API over HTTP the same way
/// the teacher's `kalshi::client::KalshiClient` talks to Kalshi: a single
/// `reqwest::Client` with a bounded timeout, JSON in, JSON out, never panics.
#[derive(Clone)]
pub struct HttpPoolApiClient {
    client: Client,
    base_url: String,
}

impl HttpPoolApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .pool_max_idle_per_host(8)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::ExternalUnavailable(format!("pool API {status}: {body}")));
        }
        resp.json::<T>().await.map_err(|e| AppError::ExternalUnavailable(format!("GET {path}: {e}")))
    }
}

#[async_trait]
impl PoolApiClient for HttpPoolApiClient {
    async fn list_pools(&self) -> AppResult<Vec<PoolInfo>> {
        self.get_json("/pools").await
    }

    async fn get_pool(&self, address: &str) -> AppResult<PoolInfo> {
        self.get_json(&format!("/pools/{address}")).await
    }

    async fn get_active_bin_onchain(&self, address: &str) -> AppResult<ActiveBin> {
        self.get_json(&format!("/pools/{address}/active-bin")).await
    }
}
