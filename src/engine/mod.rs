//! Per-bot trading engine. One `TradingEngine` instance per running bot:
//! it scans the market, scores and enters pools, checks open positions
//! against their exit rules, and reports a checkpoint of its standing on a
//! timer. The orchestrator owns the engine's lifecycle; the engine never
//! talks to other bots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::AppResult;
use crate::events::{EventBus, EventPayload};
use crate::executor::{Executor, TrackedPosition};
use crate::market::types::{PoolInfo, ScoreClassification};
use crate::market::{EligibilityFilter, MarketDataProvider};
use crate::predictor::PredictorClient;
use crate::safety::circuit_breaker::CircuitBreaker;
use crate::safety::emergency_stop::EmergencyStop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyMode {
    RuleBased,
    Ml,
    Hybrid,
}

pub fn parse_strategy_mode(raw: &str) -> AppResult<StrategyMode> {
    match raw {
        "rule_based" => Ok(StrategyMode::RuleBased),
        "ml" => Ok(StrategyMode::Ml),
        "hybrid" => Ok(StrategyMode::Hybrid),
        other => Err(crate::errors::AppError::Validation(format!("unknown strategy_mode: {other}"))),
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bot_id: String,
    pub user_id: String,
    pub strategy_mode: StrategyMode,
    pub eligibility: EligibilityFilter,
    pub scan_interval: Duration,
    pub position_check_interval: Duration,
    pub checkpoint_interval: Duration,
    pub position_size_lamports: i64,
    pub max_concurrent_positions: usize,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub max_hold: Duration,
    pub pool_cooldown: Duration,
}

impl BotConfig {
    /// Reconstructs a runtime config from a persisted bot row -- the one
    /// place that turns `config_json` back into a `BotConfig`, shared by the
    /// HTTP start path and bot recovery so the two can't drift apart on how
    /// a stored bot is rehydrated.
    pub fn from_row(row: &crate::db::BotRow) -> AppResult<Self> {
        let strategy_mode = parse_strategy_mode(&row.strategy_mode)?;
        let parsed: serde_json::Value = serde_json::from_str(&row.config_json)?;
        Ok(Self {
            bot_id: row.id.clone(),
            user_id: row.user_id.clone(),
            strategy_mode,
            eligibility: EligibilityFilter::default(),
            scan_interval: Duration::from_secs(parsed["scan_interval_seconds"].as_u64().unwrap_or(30)),
            position_check_interval: Duration::from_secs(15),
            checkpoint_interval: Duration::from_secs(60),
            position_size_lamports: parsed["position_size_lamports"].as_i64().unwrap_or(1_000_000),
            max_concurrent_positions: parsed["max_concurrent_positions"].as_u64().unwrap_or(3) as usize,
            take_profit_pct: parsed["take_profit_pct"].as_f64().unwrap_or(10.0),
            stop_loss_pct: parsed["stop_loss_pct"].as_f64().unwrap_or(5.0),
            trailing_stop_pct: parsed["trailing_stop_pct"].as_f64().unwrap_or(3.0),
            max_hold: Duration::from_secs(parsed["max_hold_seconds"].as_u64().unwrap_or(3600)),
            pool_cooldown: Duration::from_secs(120),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub scans_completed: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub errors: u64,
}

/// Tracks a pool a bot just exited so it isn't immediately re-entered on the
/// very next scan.
struct PoolCooldown {
    until: HashMap<String, Instant>,
}

impl PoolCooldown {
    fn new() -> Self {
        Self { until: HashMap::new() }
    }

    fn is_cooling_down(&self, pool_address: &str) -> bool {
        self.until.get(pool_address).map(|t| Instant::now() < *t).unwrap_or(false)
    }

    fn start(&mut self, pool_address: &str, duration: Duration) {
        self.until.insert(pool_address.to_string(), Instant::now() + duration);
    }
}

/// Highest watermark price seen per open position, used for trailing-stop
/// evaluation. The engine keeps this alongside the executor's own state
/// since trailing stops are a scan-time concern, not a ledger fact.
struct TrailingWatermarks {
    peak_price: HashMap<String, f64>,
}

impl TrailingWatermarks {
    fn new() -> Self {
        Self { peak_price: HashMap::new() }
    }

    fn update_and_get_peak(&mut self, position_id: &str, current_price: f64) -> f64 {
        let peak = self.peak_price.entry(position_id.to_string()).or_insert(current_price);
        if current_price > *peak {
            *peak = current_price;
        }
        *peak
    }

    fn clear(&mut self, position_id: &str) {
        self.peak_price.remove(position_id);
    }
}

pub struct TradingEngine {
    config: BotConfig,
    market: MarketDataProvider,
    executor: Arc<dyn Executor>,
    predictor: Option<Arc<PredictorClient>>,
    emergency_stop: Arc<EmergencyStop>,
    circuit_breaker: Arc<CircuitBreaker>,
    events: Arc<EventBus>,
    stats: std::sync::Mutex<EngineStats>,
    scanning: AtomicBool,
    cooldowns: std::sync::Mutex<PoolCooldown>,
    watermarks: std::sync::Mutex<TrailingWatermarks>,
}

impl TradingEngine {
    pub fn new(
        config: BotConfig,
        market: MarketDataProvider,
        executor: Arc<dyn Executor>,
        predictor: Option<Arc<PredictorClient>>,
        emergency_stop: Arc<EmergencyStop>,
        circuit_breaker: Arc<CircuitBreaker>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            market,
            executor,
            predictor,
            emergency_stop,
            circuit_breaker,
            events,
            stats: std::sync::Mutex::new(EngineStats::default()),
            scanning: AtomicBool::new(false),
            cooldowns: std::sync::Mutex::new(PoolCooldown::new()),
            watermarks: std::sync::Mutex::new(TrailingWatermarks::new()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        *self.stats.lock().unwrap()
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// Re-entrancy guarded: if a scan is already running when the timer
    /// fires again (a slow upstream call overran the interval), the new tick
    /// is skipped rather than queued.
    pub async fn scan(&self) -> AppResult<()> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            tracing::debug!(bot_id = %self.config.bot_id, "scan already in progress, skipping tick");
            return Ok(());
        }
        let result = self.scan_inner().await;
        self.scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn scan_inner(&self) -> AppResult<()> {
        if self.emergency_stop.is_halted() {
            return Ok(());
        }

        let pools = match self.market.list_eligible_pools(&self.config.eligibility).await {
            Ok(pools) => pools,
            Err(err) => {
                self.emergency_stop.record_api_error();
                self.stats.lock().unwrap().errors += 1;
                return Err(err);
            }
        };

        let open_positions = self.executor.active_positions(&self.config.bot_id).await?;
        self.circuit_breaker.sync_with(&open_positions);

        let mut entered = 0usize;
        if open_positions.len() < self.config.max_concurrent_positions {
            let candidates = self.select_candidates(&pools).await;
            for pool in &candidates {
                if self.cooldowns.lock().unwrap().is_cooling_down(&pool.address) {
                    continue;
                }
                if open_positions.iter().any(|p| p.pool_address == pool.address) {
                    continue;
                }

                if self.try_enter(pool).await.is_ok() {
                    entered += 1;
                    if open_positions.len() + entered >= self.config.max_concurrent_positions {
                        break;
                    }
                }
            }
        }

        self.stats.lock().unwrap().scans_completed += 1;
        self.events.emit(
            &self.config.bot_id,
            &self.config.user_id,
            EventPayload::ScanCompleted { eligible: pools.len(), entered },
        );
        Ok(())
    }

    const ML_SHORTLIST_SIZE: usize = 30;
    const HYBRID_SHORTLIST_SIZE: usize = 10;

    /// Ranks every pool strategy-mode-appropriately and returns only the
    /// ones worth attempting entry on, in priority order.
    ///
    /// Rule-based ranks by the rule score alone. ML pre-filters to the top
    /// 30 pools by raw `volume_1h`, batches them to the predictor in one
    /// call, and admits whatever the predictor itself recommends. Hybrid
    /// takes the rule-based top 10 and admits only the pools the predictor
    /// *also* recommends -- both signals must agree. Both ML and Hybrid fall
    /// back to rule-based ranking if the predictor is unconfigured or the
    /// batch call fails; a predictor that runs but recommends nothing is not
    /// a failure and yields no candidates.
    async fn select_candidates(&self, pools: &[PoolInfo]) -> Vec<PoolInfo> {
        match self.config.strategy_mode {
            StrategyMode::RuleBased => self.rule_based_candidates(pools),
            StrategyMode::Ml => match &self.predictor {
                Some(predictor) => match self.ml_candidates(pools, predictor).await {
                    Some(candidates) => candidates,
                    None => self.rule_based_candidates(pools),
                },
                None => self.rule_based_candidates(pools),
            },
            StrategyMode::Hybrid => match &self.predictor {
                Some(predictor) => match self.hybrid_candidates(pools, predictor).await {
                    Some(candidates) => candidates,
                    None => self.rule_based_candidates(pools),
                },
                None => self.rule_based_candidates(pools),
            },
        }
    }

    fn rule_based_candidates(&self, pools: &[PoolInfo]) -> Vec<PoolInfo> {
        self.top_n_by_rule_score(pools, usize::MAX, true)
    }

    /// Ranks pools by rule-based score, highest first. When `enter_only` is
    /// set, pools the rule-based scorer doesn't classify as `Enter` are
    /// dropped before truncation; Hybrid mode wants the raw top-N ranking
    /// instead, since the predictor does the final admission call.
    fn top_n_by_rule_score(&self, pools: &[PoolInfo], n: usize, enter_only: bool) -> Vec<PoolInfo> {
        let mut scored: Vec<(f64, PoolInfo)> = pools
            .iter()
            .map(|p| (self.market.market_score(p), p.clone()))
            .filter(|(score, _)| !enter_only || score.classification == ScoreClassification::Enter)
            .map(|(score, p)| (score.total, p))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// `None` means the batch call itself failed (predictor down, bad
    /// response) and the caller should fall back to rule-based ranking;
    /// `Some(vec)` is the predictor's actual admitted set, which may be
    /// legitimately empty.
    async fn ml_candidates(&self, pools: &[PoolInfo], predictor: &PredictorClient) -> Option<Vec<PoolInfo>> {
        let mut by_volume: Vec<PoolInfo> = pools.to_vec();
        by_volume.sort_by(|a, b| b.volume_1h.partial_cmp(&a.volume_1h).unwrap_or(std::cmp::Ordering::Equal));
        by_volume.truncate(Self::ML_SHORTLIST_SIZE);
        let response = predictor.predict_batch(&by_volume).await?;
        Some(admitted_by_recommendation(&by_volume, &response))
    }

    async fn hybrid_candidates(&self, pools: &[PoolInfo], predictor: &PredictorClient) -> Option<Vec<PoolInfo>> {
        let shortlisted = self.top_n_by_rule_score(pools, Self::HYBRID_SHORTLIST_SIZE, false);
        let response = predictor.predict_batch(&shortlisted).await?;
        Some(admitted_by_recommendation(&shortlisted, &response))
    }

    async fn try_enter(&self, pool: &PoolInfo) -> AppResult<TrackedPosition> {
        if self.circuit_breaker.can_open(&pool.address, self.config.position_size_lamports).is_err() {
            return Err(crate::errors::AppError::SafetyHalt("circuit breaker rejected entry".to_string()));
        }

        let amount_x = self.config.position_size_lamports / 2;
        let amount_y = self.config.position_size_lamports - amount_x;
        let entry_bin = self.market.active_bin(pool).await.bin_id;

        let position = self.executor.open(&self.config.bot_id, &pool.address, entry_bin, pool.current_price, amount_x, amount_y).await?;
        self.stats.lock().unwrap().positions_opened += 1;
        self.events.emit(
            &self.config.bot_id,
            &self.config.user_id,
            EventPayload::PositionOpened { position: Box::new(position.clone()) },
        );
        Ok(position)
    }

    /// Walks every open position and applies exit rules in a fixed order:
    /// take-profit, then trailing-stop, then stop-loss, then max-hold. The
    /// first condition that matches wins -- a position is never closed twice
    /// in the same pass.
    pub async fn check_positions(&self) -> AppResult<()> {
        let positions = self.executor.active_positions(&self.config.bot_id).await?;
        for position in positions {
            let pool = match self.market.list_eligible_pools(&EligibilityFilter::default()).await {
                Ok(pools) => pools.into_iter().find(|p| p.address == position.pool_address),
                Err(_) => None,
            };
            let current_price = pool.as_ref().map(|p| p.current_price).unwrap_or(position.current_price_per_token);
            let current_bin = match &pool {
                Some(p) => self.market.active_bin(p).await.bin_id,
                None => position.current_bin_id,
            };

            let updated = self.executor.update(&position.id, current_price, current_bin).await?;
            self.events.emit(
                &self.config.bot_id,
                &self.config.user_id,
                EventPayload::PositionUpdated {
                    position_id: updated.id.clone(),
                    current_price_per_token: updated.current_price_per_token,
                    unrealized_pnl_lamports: updated.unrealized_pnl_lamports,
                },
            );

            if let Some(reason) = self.evaluate_exit(&updated) {
                self.close_by_id(&updated.id, reason).await?;
            }
        }
        Ok(())
    }

    fn evaluate_exit(&self, position: &TrackedPosition) -> Option<&'static str> {
        let entry = position.entry_price_per_token;
        if entry <= 0.0 {
            return None;
        }
        let change_pct = (position.current_price_per_token - entry) / entry * 100.0;

        if change_pct >= self.config.take_profit_pct {
            return Some("take_profit");
        }

        let peak = self.watermarks.lock().unwrap().update_and_get_peak(&position.id, position.current_price_per_token);
        if peak > entry {
            let drawdown_from_peak_pct = (peak - position.current_price_per_token) / peak * 100.0;
            if drawdown_from_peak_pct >= self.config.trailing_stop_pct {
                return Some("trailing_stop");
            }
        }

        if change_pct <= -self.config.stop_loss_pct {
            return Some("stop_loss");
        }

        if elapsed_since(position.opened_at) >= self.config.max_hold {
            return Some("max_hold");
        }

        None
    }

    /// Closes a position and mirrors every side effect the engine itself
    /// would produce on a self-initiated exit: stats, cooldown, watermark
    /// cleanup, and the `position:closed` event. Used both from
    /// `check_positions` and from an orchestrator-driven manual close.
    pub async fn close_by_id(&self, position_id: &str, reason: &str) -> AppResult<TrackedPosition> {
        let closed = self.executor.close(position_id, reason).await?;
        self.watermarks.lock().unwrap().clear(position_id);
        self.cooldowns.lock().unwrap().start(&closed.pool_address, self.config.pool_cooldown);
        self.stats.lock().unwrap().positions_closed += 1;
        self.emergency_stop.record_trade_result(closed.realized_pnl_lamports.unwrap_or(0));
        self.events.emit(
            &self.config.bot_id,
            &self.config.user_id,
            EventPayload::PositionClosed { position: Box::new(closed.clone()) },
        );
        Ok(closed)
    }

    /// Closes every position the bot currently has open. Best-effort: one
    /// position's close failing doesn't stop the rest from being attempted,
    /// since this runs from the emergency-stop path where capital exposure
    /// matters more than a clean all-or-nothing result.
    pub async fn close_all_positions(&self, reason: &str) -> Vec<AppResult<TrackedPosition>> {
        let positions = match self.executor.active_positions(&self.config.bot_id).await {
            Ok(positions) => positions,
            Err(err) => return vec![Err(err)],
        };
        let mut results = Vec::with_capacity(positions.len());
        for position in positions {
            results.push(self.close_by_id(&position.id, reason).await);
        }
        results
    }

    /// Emits a `position:updated` event for every currently active position,
    /// the periodic checkpoint §4.6 describes -- this is a standing snapshot
    /// broadcast, not an end-of-run summary, so it must never masquerade as
    /// an `engine:stopped` event while the bot is still running.
    pub async fn emit_checkpoint_stats(&self) {
        let positions = match self.executor.active_positions(&self.config.bot_id).await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(bot_id = %self.config.bot_id, error = %err, "checkpoint failed to read active positions");
                return;
            }
        };
        for position in positions {
            self.events.emit(
                &self.config.bot_id,
                &self.config.user_id,
                EventPayload::PositionUpdated {
                    position_id: position.id.clone(),
                    current_price_per_token: position.current_price_per_token,
                    unrealized_pnl_lamports: position.unrealized_pnl_lamports,
                },
            );
        }
    }
}

/// Pools the predictor's own response actually recommends, in the shortlist's
/// original order.
fn admitted_by_recommendation(shortlisted: &[PoolInfo], response: &crate::predictor::PredictResponse) -> Vec<PoolInfo> {
    shortlisted
        .iter()
        .filter(|p| response.for_pool(&p.address).map(|pred| pred.recommendation).unwrap_or(false))
        .cloned()
        .collect()
}

fn elapsed_since(since: chrono::DateTime<chrono::Utc>) -> Duration {
    let elapsed = chrono::Utc::now() - since;
    elapsed.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppResult as Result_;
    use crate::executor::simulation::SimulationExecutor;
    use crate::market::api_client::PoolApiClient;
    use crate::safety::circuit_breaker::CircuitBreakerConfig;
    use crate::safety::emergency_stop::EmergencyStopState;
    use async_trait::async_trait;

    struct FakeClient {
        pool: PoolInfo,
    }

    #[async_trait]
    impl PoolApiClient for FakeClient {
        async fn list_pools(&self) -> Result_<Vec<PoolInfo>> {
            Ok(vec![self.pool.clone()])
        }
        async fn get_pool(&self, _address: &str) -> Result_<PoolInfo> {
            Ok(self.pool.clone())
        }
        async fn get_active_bin_onchain(&self, _address: &str) -> Result_<crate::market::types::ActiveBin> {
            Err(crate::errors::AppError::ExternalUnavailable("no chain in tests".into()))
        }
    }

    fn strong_pool() -> PoolInfo {
        PoolInfo {
            address: "pool-1".into(),
            name: "SOL-USDC".into(),
            mint_x: crate::market::types::WRAPPED_SOL_MINT.into(),
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

    fn test_config() -> BotConfig {
        BotConfig {
            bot_id: "bot-1".into(),
            user_id: "user-1".into(),
            strategy_mode: StrategyMode::RuleBased,
            eligibility: EligibilityFilter::default(),
            scan_interval: Duration::from_secs(30),
            position_check_interval: Duration::from_secs(15),
            checkpoint_interval: Duration::from_secs(60),
            position_size_lamports: 2_000_000,
            max_concurrent_positions: 3,
            take_profit_pct: 10.0,
            stop_loss_pct: 5.0,
            trailing_stop_pct: 3.0,
            max_hold: Duration::from_secs(3600),
            pool_cooldown: Duration::from_secs(60),
        }
    }

    fn build_engine(pool: PoolInfo) -> TradingEngine {
        let market = crate::market::MarketDataProvider::new(Arc::new(FakeClient { pool }));
        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let executor: Arc<dyn Executor> = Arc::new(SimulationExecutor::new(circuit_breaker.clone()));
        let emergency_stop = Arc::new(EmergencyStop::new(Default::default(), EmergencyStopState::default()));
        let events = EventBus::new();
        TradingEngine::new(test_config(), market, executor, None, emergency_stop, circuit_breaker, events)
    }

    #[tokio::test]
    async fn test_scan_enters_a_strong_pool() {
        let engine = build_engine(strong_pool());
        engine.scan().await.unwrap();
        assert_eq!(engine.stats().positions_opened, 1);
    }

    #[tokio::test]
    async fn test_halted_bot_skips_scan() {
        let engine = build_engine(strong_pool());
        engine.emergency_stop.manual_trigger("halt for test");
        engine.scan().await.unwrap();
        assert_eq!(engine.stats().scans_completed, 0);
    }

    #[tokio::test]
    async fn test_reentrant_scan_is_skipped() {
        let engine = build_engine(strong_pool());
        engine.scanning.store(true, Ordering::SeqCst);
        engine.scan().await.unwrap();
        assert_eq!(engine.stats().scans_completed, 0);
    }

    fn base_position(id: &str, current_price_per_token: f64) -> TrackedPosition {
        TrackedPosition {
            id: id.into(),
            bot_id: "bot-1".into(),
            pool_address: "pool-1".into(),
            status: crate::executor::PositionStatus::Active,
            entry_bin_id: 0,
            entry_price_per_token: 100.0,
            entry_amount_x_lamports: 1_000_000,
            entry_amount_y_lamports: 1_000_000,
            entry_tx_fee_lamports: 5_000,
            opened_at: chrono::Utc::now(),
            current_price_per_token,
            current_bin_id: 0,
            unrealized_pnl_lamports: 0,
            fee_earned_lamports: 0,
            exit_price_per_token: None,
            exit_amount_x_lamports: None,
            exit_amount_y_lamports: None,
            exit_tx_fee_lamports: None,
            realized_pnl_lamports: None,
            closed_at: None,
            close_reason: None,
        }
    }

    #[test]
    fn test_take_profit_triggers_above_threshold() {
        let engine = build_engine(strong_pool());
        let position = base_position("pos-1", 115.0);
        assert_eq!(engine.evaluate_exit(&position), Some("take_profit"));
    }

    #[test]
    fn test_stop_loss_triggers_when_never_above_entry() {
        let engine = build_engine(strong_pool());
        // never rises above entry, so the trailing-stop watermark never
        // exceeds entry price and can't pre-empt the stop-loss check.
        let position = base_position("pos-2", 90.0);
        assert_eq!(engine.evaluate_exit(&position), Some("stop_loss"));
    }

    #[test]
    fn test_trailing_stop_wins_over_stop_loss_after_a_rally() {
        let engine = build_engine(strong_pool());
        // first tick rallies the watermark up, second tick drops -- still
        // above the entry price, so stop-loss alone wouldn't fire, but the
        // drawdown from the peak exceeds the trailing-stop threshold.
        let rally = base_position("pos-3", 108.0);
        assert_eq!(engine.evaluate_exit(&rally), None);

        let pullback = base_position("pos-3", 104.0);
        assert_eq!(engine.evaluate_exit(&pullback), Some("trailing_stop"));
    }
}
