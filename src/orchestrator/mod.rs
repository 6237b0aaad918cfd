//! Process-wide bot supervisor. Owns every running `TradingEngine`, starts
//! and stops them on request, and bridges engine events into durable
//! storage. Per-bot operations are serialized through a per-bot lock so two
//! concurrent start/stop calls for the same bot never race, while calls
//! against different bots run fully in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::db::DbHandle;
use crate::engine::{BotConfig, TradingEngine};
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, EventPayload};
use crate::executor::simulation::SimulationExecutor;
use crate::executor::Executor;
use crate::market::api_client::PoolApiClient;
use crate::predictor::PredictorClient;
use crate::safety::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::safety::emergency_stop::{EmergencyStop, EmergencyStopConfig, EmergencyStopState};

struct RunningBot {
    engine: Arc<TradingEngine>,
    emergency_stop: Arc<EmergencyStop>,
    tasks: Vec<JoinHandle<()>>,
}

/// One entry per bot that has ever been started this process lifetime,
/// guarding concurrent start/stop/emergency-stop calls for that specific bot.
type BotLock = Arc<AsyncMutex<()>>;

pub struct BotOrchestrator {
    db: DbHandle,
    events: Arc<EventBus>,
    pool_api_client: Arc<dyn PoolApiClient>,
    predictor: Option<Arc<PredictorClient>>,
    running: std::sync::Mutex<HashMap<String, RunningBot>>,
    bot_locks: std::sync::Mutex<HashMap<String, BotLock>>,
}

impl BotOrchestrator {
    pub fn new(
        db: DbHandle,
        events: Arc<EventBus>,
        pool_api_client: Arc<dyn PoolApiClient>,
        predictor: Option<Arc<PredictorClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            events,
            pool_api_client,
            predictor,
            running: std::sync::Mutex::new(HashMap::new()),
            bot_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, bot_id: &str) -> BotLock {
        self.bot_locks.lock().unwrap().entry(bot_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub fn is_running(&self, bot_id: &str) -> bool {
        self.running.lock().unwrap().contains_key(bot_id)
    }

    pub async fn start_bot(
        self: &Arc<Self>,
        config: BotConfig,
        executor: Arc<dyn Executor>,
        emergency_stop: Arc<EmergencyStop>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> AppResult<()> {
        let bot_id = config.bot_id.clone();
        let lock = self.lock_for(&bot_id);
        let _guard = lock.lock().await;

        if self.is_running(&bot_id) {
            return Err(AppError::BusinessRule(format!("bot {bot_id} is already running")));
        }

        let market = self.build_market_provider();
        let predictor = self.build_predictor();

        let engine = Arc::new(TradingEngine::new(
            config.clone(),
            market,
            executor,
            predictor,
            emergency_stop.clone(),
            circuit_breaker,
            self.events.clone(),
        ));

        self.install_event_bridge(&bot_id, &config.user_id);
        self.install_emergency_stop_bridge(&bot_id, &engine, &emergency_stop);

        let mut tasks = Vec::new();
        tasks.push(self.spawn_scan_loop(engine.clone(), config.scan_interval));
        tasks.push(self.spawn_position_check_loop(engine.clone(), config.position_check_interval));
        tasks.push(self.spawn_checkpoint_loop(engine.clone(), config.checkpoint_interval));

        self.running.lock().unwrap().insert(bot_id.clone(), RunningBot { engine, emergency_stop, tasks });

        self.events.emit(&bot_id, &config.user_id, EventPayload::EngineStarted);
        self.db.set_bot_running(&bot_id, true).await?;
        Ok(())
    }

    pub async fn stop_bot(self: &Arc<Self>, bot_id: &str) -> AppResult<()> {
        let lock = self.lock_for(bot_id);
        let _guard = lock.lock().await;

        let running = self.running.lock().unwrap().remove(bot_id);
        let Some(running) = running else {
            return Err(AppError::NotFound(format!("bot {bot_id} is not running")));
        };

        for task in running.tasks {
            task.abort();
        }

        let stats = running.engine.stats();
        self.events.emit(bot_id, running.engine.user_id(), EventPayload::EngineStopped { stats });
        self.db.set_bot_running(bot_id, false).await?;
        Ok(())
    }

    /// Engages the bot's kill switch and stops its timers, but leaves its
    /// positions as-is -- an emergency stop halts new trading, it does not
    /// force-liquidate.
    pub async fn emergency_stop(self: &Arc<Self>, bot_id: &str, reason: &str) -> AppResult<()> {
        let lock = self.lock_for(bot_id);
        let _guard = lock.lock().await;

        let running = self.running.lock().unwrap();
        let Some(bot) = running.get(bot_id) else {
            return Err(AppError::NotFound(format!("bot {bot_id} is not running")));
        };
        bot.emergency_stop.manual_trigger(reason);
        Ok(())
    }

    /// User-initiated close, routed through the bot's own engine so it gets
    /// the exact same side effects (cooldown, watermark cleanup, event) a
    /// self-triggered exit would.
    pub async fn close_position(&self, bot_id: &str, position_id: &str, reason: &str) -> AppResult<crate::executor::TrackedPosition> {
        let engine = {
            let running = self.running.lock().unwrap();
            let bot = running.get(bot_id).ok_or_else(|| AppError::NotFound(format!("bot {bot_id} is not running")))?;
            bot.engine.clone()
        };
        engine.close_by_id(position_id, reason).await
    }

    /// Cooperative shutdown of every running bot with a hard deadline -- any
    /// bot whose tasks haven't wound down by the deadline is aborted anyway
    /// so process shutdown never hangs on one stuck engine.
    pub async fn stop_all(self: &Arc<Self>, deadline: Duration) {
        let bot_ids: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        let stop_futures = bot_ids.into_iter().map(|bot_id| {
            let this = self.clone();
            async move {
                if let Err(err) = this.stop_bot(&bot_id).await {
                    tracing::warn!(%bot_id, error = %err, "error stopping bot during shutdown");
                }
            }
        });

        if tokio::time::timeout(deadline, futures_util::future::join_all(stop_futures)).await.is_err() {
            tracing::warn!("shutdown deadline exceeded, remaining bot tasks force-aborted");
        }
    }

    /// Restarts every bot that was marked running at last shutdown. Each bot
    /// gets a fresh simulation executor and circuit breaker and its
    /// persisted emergency-stop state restored via `BotConfig::from_row`, the
    /// same path `POST /bots/:id/start` uses. A bot whose row can't be
    /// rehydrated or that fails to start is marked `status=error` with the
    /// failure recorded rather than left silently down. Returns the number
    /// of bots actually recovered.
    pub async fn recover_running_bots(self: &Arc<Self>) -> AppResult<usize> {
        let bot_ids = self.db.list_running_bot_ids().await?;
        let mut recovered = 0usize;
        for bot_id in bot_ids {
            match self.recover_one_bot(&bot_id).await {
                Ok(()) => recovered += 1,
                Err(err) => {
                    tracing::error!(%bot_id, error = %err, "failed to recover bot at startup");
                    if let Err(db_err) = self.db.set_bot_running(&bot_id, false).await {
                        tracing::error!(%bot_id, error = %db_err, "failed to clear is_running after failed recovery");
                    }
                    if let Err(db_err) = self.db.set_bot_last_error(&bot_id, Some(err.to_string())).await {
                        tracing::error!(%bot_id, error = %db_err, "failed to record last_error after failed recovery");
                    }
                }
            }
        }
        Ok(recovered)
    }

    async fn recover_one_bot(self: &Arc<Self>, bot_id: &str) -> AppResult<()> {
        let row = self.db.get_bot_row(bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
        let config = BotConfig::from_row(&row)?;

        let emergency_stop_state = row.emergency_stop_state.as_deref().map(EmergencyStopState::from_blob).unwrap_or_default();

        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let executor: Arc<dyn Executor> = Arc::new(SimulationExecutor::new(circuit_breaker.clone()));
        let emergency_stop = Arc::new(EmergencyStop::new(EmergencyStopConfig::default(), emergency_stop_state));

        self.start_bot(config, executor, emergency_stop, circuit_breaker).await
    }

    fn build_market_provider(&self) -> crate::market::MarketDataProvider {
        crate::market::MarketDataProvider::new(self.pool_api_client.clone())
    }

    fn build_predictor(&self) -> Option<Arc<crate::predictor::PredictorClient>> {
        self.predictor.clone()
    }

    fn spawn_scan_loop(&self, engine: Arc<TradingEngine>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.scan().await {
                    tracing::warn!(error = %err, "scan tick failed");
                }
            }
        })
    }

    fn spawn_position_check_loop(&self, engine: Arc<TradingEngine>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.check_positions().await {
                    tracing::warn!(error = %err, "position check tick failed");
                }
            }
        })
    }

    fn spawn_checkpoint_loop(&self, engine: Arc<TradingEngine>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.emit_checkpoint_stats().await;
            }
        })
    }

    /// Subscribes to the bot's own kill switch so a self-triggered halt
    /// (daily loss, consecutive losses, tx/API error bursts) gets the same
    /// forced shutdown a manual emergency stop would, instead of just
    /// blocking new entries while the engine keeps ticking. The callback
    /// fires synchronously under the emergency-stop's internal lock, so it
    /// only schedules the real work and returns immediately.
    fn install_emergency_stop_bridge(self: &Arc<Self>, bot_id: &str, engine: &Arc<TradingEngine>, emergency_stop: &Arc<EmergencyStop>) {
        let orchestrator = self.clone();
        let bot_id = bot_id.to_string();
        let engine = engine.clone();
        emergency_stop.on_transition(move |state| {
            if !state.kill_switch_engaged {
                return;
            }
            let orchestrator = orchestrator.clone();
            let bot_id = bot_id.clone();
            let engine = engine.clone();
            let reason = state.triggered_reason.clone().unwrap_or_else(|| "unspecified".to_string());
            tokio::spawn(async move {
                orchestrator.handle_emergency_halt(&bot_id, &engine, &reason).await;
            });
        });
    }

    /// Runs once a bot's kill switch engages: closes every open position,
    /// tears down its timers, and persists the halt so it stays stopped
    /// across a process restart instead of silently resuming.
    async fn handle_emergency_halt(self: &Arc<Self>, bot_id: &str, engine: &Arc<TradingEngine>, reason: &str) {
        tracing::error!(%bot_id, %reason, "emergency stop engaged, force-halting bot");

        for result in engine.close_all_positions("emergency_stop").await {
            if let Err(err) = result {
                tracing::warn!(%bot_id, error = %err, "failed to close a position during emergency halt");
            }
        }

        let lock = self.lock_for(bot_id);
        let _guard = lock.lock().await;
        if let Some(running) = self.running.lock().unwrap().remove(bot_id) {
            for task in running.tasks {
                task.abort();
            }
        }

        let message = format!("Emergency stop: {reason}");
        self.events.emit(bot_id, engine.user_id(), EventPayload::EngineError { reason: message.clone() });
        if let Err(err) = self.db.set_bot_running(bot_id, false).await {
            tracing::error!(%bot_id, error = %err, "failed to persist is_running=false during emergency halt");
        }
        if let Err(err) = self.db.set_bot_last_error(bot_id, Some(message)).await {
            tracing::error!(%bot_id, error = %err, "failed to persist last_error during emergency halt");
        }
    }

    /// Wires the durability bridge: every event this bot emits is persisted
    /// by the DB writer task, independent of any SSE subscriber being
    /// connected.
    fn install_event_bridge(&self, bot_id: &str, user_id: &str) {
        let db = self.db.clone();
        let bot_id_owned = bot_id.to_string();
        let user_id_owned = user_id.to_string();
        let _unsub = self.events.subscribe_bot(bot_id, move |event| {
            let db = db.clone();
            let event = event.clone();
            let bot_id = bot_id_owned.clone();
            let _ = user_id_owned;
            tokio::spawn(async move {
                if let Err(err) = db.persist_event(&bot_id, &event).await {
                    tracing::error!(%bot_id, error = %err, "failed to persist bot event");
                }
            });
        });
        // Intentionally leaked: the subscription lives for the bot's entire
        // run and is torn down implicitly when the event bus itself drops.
        std::mem::forget(_unsub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopClient;

    #[async_trait]
    impl PoolApiClient for NoopClient {
        async fn list_pools(&self) -> AppResult<Vec<crate::market::types::PoolInfo>> {
            Ok(Vec::new())
        }
        async fn get_pool(&self, address: &str) -> AppResult<crate::market::types::PoolInfo> {
            Err(AppError::NotFound(address.to_string()))
        }
        async fn get_active_bin_onchain(&self, _address: &str) -> AppResult<crate::market::types::ActiveBin> {
            Err(AppError::ExternalUnavailable("noop".into()))
        }
    }

    fn test_orchestrator() -> Arc<BotOrchestrator> {
        let events = EventBus::new();
        let db = DbHandle::in_memory_for_tests().expect("in-memory db");
        BotOrchestrator::new(db, events, Arc::new(NoopClient), None)
    }

    #[tokio::test]
    async fn test_bot_lock_is_reused_across_calls() {
        let orchestrator = test_orchestrator();
        let lock_a = orchestrator.lock_for("bot-1");
        let lock_b = orchestrator.lock_for("bot-1");
        assert!(Arc::ptr_eq(&lock_a, &lock_b));
    }

    #[tokio::test]
    async fn test_distinct_bots_get_distinct_locks() {
        let orchestrator = test_orchestrator();
        let lock_a = orchestrator.lock_for("bot-1");
        let lock_b = orchestrator.lock_for("bot-2");
        assert!(!Arc::ptr_eq(&lock_a, &lock_b));
    }

    #[tokio::test]
    async fn test_recover_running_bots_is_noop_with_none_running() {
        let orchestrator = test_orchestrator();
        let recovered = orchestrator.recover_running_bots().await.unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn test_recover_running_bots_restarts_a_persisted_bot() {
        let orchestrator = test_orchestrator();
        let config_json = serde_json::json!({
            "scan_interval_seconds": 30,
            "position_size_lamports": 1_000_000,
            "max_concurrent_positions": 3,
            "take_profit_pct": 10.0,
            "stop_loss_pct": 5.0,
            "trailing_stop_pct": 3.0,
            "max_hold_seconds": 3600,
        })
        .to_string();
        orchestrator.db.insert_bot("bot-1", "user-1", "test bot", "rule_based", config_json).await.unwrap();
        orchestrator.db.set_bot_running("bot-1", true).await.unwrap();

        let recovered = orchestrator.recover_running_bots().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(orchestrator.is_running("bot-1"));
    }

    #[tokio::test]
    async fn test_recover_running_bots_marks_unrecoverable_bot_as_errored() {
        let orchestrator = test_orchestrator();
        orchestrator.db.insert_bot("bot-1", "user-1", "test bot", "not_a_real_mode", "{}".to_string()).await.unwrap();
        orchestrator.db.set_bot_running("bot-1", true).await.unwrap();

        let recovered = orchestrator.recover_running_bots().await.unwrap();
        assert_eq!(recovered, 0);
        let row = orchestrator.db.get_bot_row("bot-1").unwrap().unwrap();
        assert!(!row.is_running);
        assert!(row.last_error.is_some());
    }
}
