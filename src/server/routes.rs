use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;

use crate::engine::BotConfig;
use crate::errors::{AppError, AppResult};
use crate::executor::simulation::SimulationExecutor;
use crate::executor::Executor;
use crate::safety::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::safety::emergency_stop::{EmergencyStop, EmergencyStopConfig, EmergencyStopState};
use crate::server::auth::AuthUser;
use crate::state::AppState;

const MAX_BOTS_PER_USER: i64 = 10;

#[derive(Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    pub strategy_mode: String,
    pub position_size_lamports: i64,
    pub max_concurrent_positions: usize,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub max_hold_seconds: u64,
    pub scan_interval_seconds: u64,
}

/// POST /bots -- registers a bot row for the authenticated user. Does not
/// start it; a bot is created stopped and must be started explicitly.
pub async fn create_bot(State(state): State<Arc<AppState>>, user: AuthUser, Json(req): Json<CreateBotRequest>) -> AppResult<Json<serde_json::Value>> {
    crate::engine::parse_strategy_mode(&req.strategy_mode)?;
    if req.position_size_lamports <= 0 {
        return Err(AppError::Validation("position_size_lamports must be positive".to_string()));
    }

    if state.db.count_bots_for_user(&user.user_id)? >= MAX_BOTS_PER_USER {
        return Err(AppError::Validation(format!("bot limit reached: max {MAX_BOTS_PER_USER} bots per user")));
    }

    let bot_id = uuid::Uuid::new_v4().to_string();
    let config_json = serde_json::to_string(&serde_json::json!({
        "name": req.name,
        "strategy_mode": req.strategy_mode,
        "position_size_lamports": req.position_size_lamports,
        "max_concurrent_positions": req.max_concurrent_positions,
        "take_profit_pct": req.take_profit_pct,
        "stop_loss_pct": req.stop_loss_pct,
        "trailing_stop_pct": req.trailing_stop_pct,
        "max_hold_seconds": req.max_hold_seconds,
        "scan_interval_seconds": req.scan_interval_seconds,
    }))?;

    state
        .db
        .insert_bot(&bot_id, &user.user_id, &req.name, &req.strategy_mode, config_json.clone())
        .await?;
    state.db.insert_trade_log(&bot_id, None, "bot_created", config_json).await?;

    Ok(Json(serde_json::json!({ "bot_id": bot_id, "user_id": user.user_id })))
}

/// GET /bots -- every bot owned by the authenticated user.
pub async fn list_bots(State(state): State<Arc<AppState>>, user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let bots = state.db.list_bots_for_user(&user.user_id)?;
    Ok(Json(serde_json::json!({ "bots": bots })))
}

/// GET /bots/:id -- current bot row, including its persisted emergency-stop
/// state and last error.
pub async fn get_bot(State(state): State<Arc<AppState>>, user: AuthUser, Path(bot_id): Path<String>) -> AppResult<Json<crate::db::BotRow>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    Ok(Json(row))
}

/// PUT /bots/:id -- replaces a stopped bot's config. Rejected while running
/// since a live engine has already captured its `BotConfig` by value.
pub async fn update_bot_config(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(bot_id): Path<String>,
    Json(req): Json<CreateBotRequest>,
) -> AppResult<Json<serde_json::Value>> {
    crate::engine::parse_strategy_mode(&req.strategy_mode)?;
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    if row.is_running {
        return Err(AppError::BusinessRule("cannot update config while bot is running".to_string()));
    }

    let config_json = serde_json::to_string(&serde_json::json!({
        "name": req.name,
        "strategy_mode": req.strategy_mode,
        "position_size_lamports": req.position_size_lamports,
        "max_concurrent_positions": req.max_concurrent_positions,
        "take_profit_pct": req.take_profit_pct,
        "stop_loss_pct": req.stop_loss_pct,
        "trailing_stop_pct": req.trailing_stop_pct,
        "max_hold_seconds": req.max_hold_seconds,
        "scan_interval_seconds": req.scan_interval_seconds,
    }))?;
    state.db.update_bot_config(&bot_id, &req.name, &req.strategy_mode, config_json).await?;
    Ok(Json(serde_json::json!({ "bot_id": bot_id, "status": "updated" })))
}

/// DELETE /bots/:id -- stopped bots only; cascades to positions/trade_log.
pub async fn delete_bot(State(state): State<Arc<AppState>>, user: AuthUser, Path(bot_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    if row.is_running {
        return Err(AppError::BusinessRule("cannot delete a running bot".to_string()));
    }
    state.db.delete_bot(&bot_id).await?;
    Ok(Json(serde_json::json!({ "bot_id": bot_id, "status": "deleted" })))
}

/// POST /bots/:id/start -- builds a fresh engine for the bot and hands it to
/// the orchestrator. Defaults to the simulation executor; a live bot's
/// wallet-backed executor is wired in by the caller that owns the wallet
/// key material, not by this route.
pub async fn start_bot(State(state): State<Arc<AppState>>, user: AuthUser, Path(bot_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }

    let config = BotConfig::from_row(&row)?;

    let emergency_stop_state = row
        .emergency_stop_state
        .as_deref()
        .map(EmergencyStopState::from_blob)
        .unwrap_or_default();

    let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let executor: Arc<dyn Executor> = Arc::new(SimulationExecutor::new(circuit_breaker.clone()));
    let emergency_stop = Arc::new(EmergencyStop::new(EmergencyStopConfig::default(), emergency_stop_state));

    state.orchestrator.start_bot(config, executor, emergency_stop, circuit_breaker).await?;
    Ok(Json(serde_json::json!({ "bot_id": bot_id, "status": "started" })))
}

/// POST /bots/:id/stop -- cooperative stop of a running bot.
pub async fn stop_bot(State(state): State<Arc<AppState>>, user: AuthUser, Path(bot_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    state.orchestrator.stop_bot(&bot_id).await?;
    Ok(Json(serde_json::json!({ "bot_id": bot_id, "status": "stopped" })))
}

#[derive(Deserialize)]
pub struct EmergencyStopRequest {
    pub reason: String,
}

/// POST /bots/:id/emergency-stop -- manual kill switch, independent of the
/// bot's own financial triggers.
pub async fn emergency_stop_bot(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(bot_id): Path<String>,
    Json(req): Json<EmergencyStopRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    state.orchestrator.emergency_stop(&bot_id, &req.reason).await?;
    Ok(Json(serde_json::json!({ "bot_id": bot_id, "status": "halted" })))
}

/// GET /bots/:id/positions -- every position ever opened for the bot,
/// newest first.
pub async fn get_positions(State(state): State<Arc<AppState>>, user: AuthUser, Path(bot_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let row = state.db.get_bot_row(&bot_id)?.ok_or_else(|| AppError::NotFound(format!("bot {bot_id} not found")))?;
    if row.user_id != user.user_id {
        return Err(AppError::Auth("bot does not belong to this user".to_string()));
    }
    let positions = state.db.list_positions(&bot_id)?;
    Ok(Json(serde_json::json!({ "positions": positions })))
}

/// GET /positions/active -- every open position across all of the user's bots.
pub async fn list_active_positions(State(state): State<Arc<AppState>>, user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let positions = state.db.list_active_positions_for_user(&user.user_id)?;
    Ok(Json(serde_json::json!({ "positions": positions })))
}

/// GET /positions/history -- every closed/errored position across the user's bots.
pub async fn list_position_history(State(state): State<Arc<AppState>>, user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let positions = state.db.list_position_history_for_user(&user.user_id)?;
    Ok(Json(serde_json::json!({ "positions": positions })))
}

/// GET /positions/:positionId -- single position, ownership-checked via its bot.
pub async fn get_position(State(state): State<Arc<AppState>>, user: AuthUser, Path(position_id): Path<String>) -> AppResult<Json<crate::executor::TrackedPosition>> {
    let (position, owner_id) =
        state.db.get_position_with_owner(&position_id)?.ok_or_else(|| AppError::NotFound(format!("position {position_id} not found")))?;
    if owner_id != user.user_id {
        return Err(AppError::Auth("position does not belong to this user".to_string()));
    }
    Ok(Json(position))
}

/// POST /positions/:positionId/close -- user-initiated close, routed through
/// the owning bot's live engine so it picks up the normal close side effects.
pub async fn close_position(State(state): State<Arc<AppState>>, user: AuthUser, Path(position_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let (position, owner_id) =
        state.db.get_position_with_owner(&position_id)?.ok_or_else(|| AppError::NotFound(format!("position {position_id} not found")))?;
    if owner_id != user.user_id {
        return Err(AppError::Auth("position does not belong to this user".to_string()));
    }
    let closed = state.orchestrator.close_position(&position.bot_id, &position_id, "user_requested").await?;
    Ok(Json(serde_json::json!({ "position": closed })))
}

/// GET /health -- unauthenticated liveness probe; answers from process
/// memory only, no DB or predictor round-trip.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /ml/health -- passthrough to the predictor's own health contract;
/// always 200, since an unreachable predictor is a normal fallback state,
/// not a failure of this service.
pub async fn ml_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let reachable = match &state.predictor {
        Some(predictor) => predictor.is_healthy().await,
        None => false,
    };
    Json(serde_json::json!({ "predictor_reachable": reachable }))
}

fn require_predictor(state: &AppState) -> AppResult<Arc<crate::predictor::PredictorClient>> {
    state.predictor.clone().ok_or_else(|| AppError::ExternalUnavailable("predictor not configured".to_string()))
}

/// POST /ml/predict -- raw passthrough of the predictor's batch prediction
/// contract; unlike `TradingEngine`'s internal scoring use of the predictor,
/// this surfaces a 503 on failure rather than falling back silently.
pub async fn ml_predict(State(state): State<Arc<AppState>>, _user: AuthUser, Json(body): Json<serde_json::Value>) -> AppResult<Json<serde_json::Value>> {
    let predictor = require_predictor(&state)?;
    Ok(Json(predictor.proxy_post("/predict", body).await?))
}

/// POST /ml/reload -- asks the predictor to reload its model weights.
pub async fn ml_reload(State(state): State<Arc<AppState>>, _user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let predictor = require_predictor(&state)?;
    Ok(Json(predictor.proxy_post("/reload", serde_json::json!({})).await?))
}

/// GET /ml/feedback -- training-feedback export passthrough.
pub async fn ml_feedback(State(state): State<Arc<AppState>>, _user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let predictor = require_predictor(&state)?;
    Ok(Json(predictor.proxy_get("/feedback").await?))
}

#[derive(Deserialize)]
pub struct CreatePresetRequest {
    pub name: String,
    pub description: String,
    pub config_json: serde_json::Value,
}

/// GET /presets -- system presets plus the user's own.
pub async fn list_presets(State(state): State<Arc<AppState>>, user: AuthUser) -> AppResult<Json<serde_json::Value>> {
    let presets = state.db.list_presets_for_user(&user.user_id)?;
    Ok(Json(serde_json::json!({ "presets": presets })))
}

/// POST /presets -- saves a user-owned strategy preset.
pub async fn create_preset(State(state): State<Arc<AppState>>, user: AuthUser, Json(req): Json<CreatePresetRequest>) -> AppResult<Json<serde_json::Value>> {
    let preset_id = uuid::Uuid::new_v4().to_string();
    let config_json = serde_json::to_string(&req.config_json)?;
    state.db.insert_preset(&preset_id, Some(user.user_id), &req.name, &req.description, config_json).await?;
    Ok(Json(serde_json::json!({ "preset_id": preset_id })))
}

/// GET /counters -- lock-free performance counters.
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    Json(serde_json::json!({
        "scans_completed": state.counters.scans_completed.load(Relaxed),
        "positions_opened": state.counters.positions_opened.load(Relaxed),
        "positions_closed": state.counters.positions_closed.load(Relaxed),
        "errors_recovered": state.counters.errors_recovered.load(Relaxed),
        "events_emitted": state.counters.events_emitted.load(Relaxed),
    }))
}
