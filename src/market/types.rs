//! Pool and bin wire types shared by the cache, the provider, and scoring.

use serde::{Deserialize, Serialize};

pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub address: String,
    pub name: String,
    pub mint_x: String,
    pub mint_y: String,
    pub bin_step: u32,
    pub current_price: f64,
    pub liquidity: f64,
    pub volume_30m: f64,
    pub volume_1h: f64,
    pub volume_2h: f64,
    pub volume_4h: f64,
    pub volume_24h: f64,
    pub fees_30m: f64,
    pub fees_1h: f64,
    pub fees_24h: f64,
    pub apr: f64,
    #[serde(default)]
    pub is_blacklisted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActiveBin {
    pub bin_id: i32,
    pub price: f64,
    /// true when derived from API price rather than read on-chain.
    #[serde(default)]
    pub synthetic: bool,
}

/// `binId = round(ln(price) / ln(1 + binStep/10000))`, the fallback used when
/// an on-chain bin read fails.
pub fn synthesize_bin(price: f64, bin_step: u32) -> ActiveBin {
    let step_factor = 1.0 + (bin_step as f64 / 10_000.0);
    let bin_id = if price > 0.0 && step_factor > 1.0 {
        (price.ln() / step_factor.ln()).round() as i32
    } else {
        0
    };
    ActiveBin { bin_id, price, synthetic: true }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreClassification {
    Enter,
    Wait,
    Skip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketScore {
    pub total: f64,
    pub classification: ScoreClassification,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_bin_matches_formula() {
        let bin = synthesize_bin(1.0, 10);
        // ln(1.0) == 0 regardless of bin step
        assert_eq!(bin.bin_id, 0);
        assert!(bin.synthetic);
    }

    #[test]
    fn test_synthesize_bin_above_one() {
        let bin = synthesize_bin(1.5, 25);
        let expected = (1.5_f64.ln() / 1.0025_f64.ln()).round() as i32;
        assert_eq!(bin.bin_id, expected);
    }
}
