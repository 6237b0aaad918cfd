//! Per-bot transient throttle. Where the emergency stop is a hard financial
//! kill switch, the circuit breaker guards against short-lived overload --
//! too many open positions, too much exposure to one pool, or a burst of
//! open attempts -- and recovers on its own once the bot's live position
//! state is back in sync.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::executor::TrackedPosition;

const OPEN_ATTEMPT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_open_positions: u32,
    pub max_positions_per_pool: u32,
    pub max_exposure_lamports: i64,
    pub max_open_attempts_per_minute: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 10,
            max_positions_per_pool: 2,
            max_exposure_lamports: 20_000_000_000,
            max_open_attempts_per_minute: 12,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    open_position_count: u32,
    positions_per_pool: HashMap<String, u32>,
    current_exposure_lamports: i64,
    open_attempt_timestamps: Vec<DateTime<Utc>>,
    tripped_until: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, state: Mutex::new(CircuitBreakerState::default()) }
    }

    /// Six-step ordered gate: cooldown, attempt-rate, max open positions,
    /// per-pool cap, exposure cap, then (implicitly) allow. Records the
    /// attempt before evaluating rate so a rejected attempt still counts
    /// against the burst window.
    pub fn can_open(&self, pool_address: &str, amount_lamports: i64) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        if let Some(until) = state.tripped_until {
            if now < until {
                return Err(format!("circuit breaker cooling down until {until}"));
            }
            state.tripped_until = None;
        }

        let cutoff = now - chrono::Duration::from_std(OPEN_ATTEMPT_WINDOW).unwrap();
        state.open_attempt_timestamps.retain(|t| *t >= cutoff);
        state.open_attempt_timestamps.push(now);
        if state.open_attempt_timestamps.len() as u32 > self.config.max_open_attempts_per_minute {
            state.tripped_until = Some(now + chrono::Duration::from_std(self.config.cooldown).unwrap());
            return Err("open attempt rate exceeded, cooling down".to_string());
        }

        if state.open_position_count >= self.config.max_open_positions {
            return Err(format!("max open positions reached: {}", state.open_position_count));
        }

        let per_pool = *state.positions_per_pool.get(pool_address).unwrap_or(&0);
        if per_pool >= self.config.max_positions_per_pool {
            return Err(format!("max positions per pool reached for {pool_address}: {per_pool}"));
        }

        if state.current_exposure_lamports + amount_lamports > self.config.max_exposure_lamports {
            return Err(format!(
                "exposure cap exceeded: {} + {} > {}",
                state.current_exposure_lamports, amount_lamports, self.config.max_exposure_lamports
            ));
        }

        Ok(())
    }

    /// Narrower gate used before read-only upstream calls: only the cooldown
    /// applies, since a quote lookup carries no position risk.
    pub fn can_make_api_call(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.tripped_until {
            Some(until) => Utc::now() >= until,
            None => true,
        }
    }

    /// Incremental counters bumped on each individual open -- the normal
    /// mid-scan mechanism, so a burst of opens within one scan tick is
    /// reflected immediately rather than waiting for the next `sync_with`.
    pub fn record_position_opened(&self, pool_address: &str, amount_lamports: i64) {
        let mut state = self.state.lock().unwrap();
        state.open_position_count += 1;
        *state.positions_per_pool.entry(pool_address.to_string()).or_insert(0) += 1;
        state.current_exposure_lamports += amount_lamports;
    }

    /// Incremental counterpart to `record_position_opened`, called on close.
    pub fn record_position_closed(&self, pool_address: &str, amount_lamports: i64) {
        let mut state = self.state.lock().unwrap();
        state.open_position_count = state.open_position_count.saturating_sub(1);
        if let Some(count) = state.positions_per_pool.get_mut(pool_address) {
            *count = count.saturating_sub(1);
        }
        state.current_exposure_lamports = (state.current_exposure_lamports - amount_lamports).max(0);
    }

    /// Recomputes counters from the authoritative position list. Reserved for
    /// start-up and recovery -- normal operation uses the incremental
    /// recorders above so per-pool/exposure caps can't be bypassed within a
    /// single scan. Clamped at zero so a stale decrement never underflows if
    /// positions were already reconciled elsewhere.
    pub fn sync_with(&self, positions: &[TrackedPosition]) {
        let mut state = self.state.lock().unwrap();
        let mut per_pool: HashMap<String, u32> = HashMap::new();
        let mut exposure: i64 = 0;
        let mut count: u32 = 0;

        for position in positions {
            if position.status == crate::executor::PositionStatus::Active {
                count += 1;
                *per_pool.entry(position.pool_address.clone()).or_insert(0) += 1;
                exposure += position.entry_amount_x_lamports + position.entry_amount_y_lamports;
            }
        }

        state.open_position_count = count;
        state.positions_per_pool = per_pool;
        state.current_exposure_lamports = exposure.max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PositionStatus;
    use uuid::Uuid;

    fn sample_position(pool: &str, amount: i64, status: PositionStatus) -> TrackedPosition {
        TrackedPosition {
            id: Uuid::new_v4().to_string(),
            bot_id: "bot-1".into(),
            pool_address: pool.into(),
            status,
            entry_bin_id: 0,
            entry_price_per_token: 1.0,
            entry_amount_x_lamports: amount,
            entry_amount_y_lamports: 0,
            entry_tx_fee_lamports: 0,
            opened_at: Utc::now(),
            current_price_per_token: 1.0,
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
    fn test_max_open_positions_blocks_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { max_open_positions: 1, ..Default::default() });
        let positions = vec![sample_position("pool-a", 1_000, PositionStatus::Active)];
        breaker.sync_with(&positions);
        assert!(breaker.can_open("pool-b", 1_000).is_err());
    }

    #[test]
    fn test_per_pool_cap_blocks_same_pool_only() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { max_positions_per_pool: 1, max_open_positions: 10, ..Default::default() });
        let positions = vec![sample_position("pool-a", 1_000, PositionStatus::Active)];
        breaker.sync_with(&positions);
        assert!(breaker.can_open("pool-a", 1_000).is_err());
        assert!(breaker.can_open("pool-b", 1_000).is_ok());
    }

    #[test]
    fn test_exposure_cap_blocks_oversized_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { max_exposure_lamports: 1_000, ..Default::default() });
        assert!(breaker.can_open("pool-a", 2_000).is_err());
    }

    #[test]
    fn test_attempt_burst_trips_cooldown() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { max_open_attempts_per_minute: 2, ..Default::default() });
        assert!(breaker.can_open("pool-a", 1).is_ok());
        assert!(breaker.can_open("pool-a", 1).is_ok());
        assert!(breaker.can_open("pool-a", 1).is_err());
        assert!(!breaker.can_make_api_call());
    }

    #[test]
    fn test_closed_positions_do_not_count_toward_exposure() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let positions = vec![sample_position("pool-a", 1_000, PositionStatus::Closed)];
        breaker.sync_with(&positions);
        assert!(breaker.can_open("pool-a", 1_000).is_ok());
    }
}
