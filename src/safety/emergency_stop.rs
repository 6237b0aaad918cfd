//! Per-bot financial kill switch. Independent of the circuit breaker: the
//! circuit breaker throttles transient load, the emergency stop halts a bot
//! permanently (until manually reset) once it crosses a hard financial line.
//! State is persisted as an opaque JSON blob the orchestrator writes
//! alongside the bot row -- nothing here assumes a particular storage layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

const FAILURE_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct EmergencyStopConfig {
    pub max_daily_loss_lamports: i64,
    pub max_total_loss_lamports: i64,
    pub max_consecutive_losses: u32,
    pub max_tx_failures_per_window: u32,
    pub max_api_errors_per_window: u32,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_lamports: 1_000_000_000,
            max_total_loss_lamports: 5_000_000_000,
            max_consecutive_losses: 5,
            max_tx_failures_per_window: 5,
            max_api_errors_per_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopState {
    pub kill_switch_engaged: bool,
    pub triggered_reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub daily_pnl_lamports: i64,
    pub total_pnl_lamports: i64,
    pub consecutive_losses: u32,
    pub last_reset_date: NaiveDate,
    pub tx_failure_timestamps: Vec<DateTime<Utc>>,
    pub api_error_timestamps: Vec<DateTime<Utc>>,
}

impl Default for EmergencyStopState {
    fn default() -> Self {
        Self {
            kill_switch_engaged: false,
            triggered_reason: None,
            triggered_at: None,
            daily_pnl_lamports: 0,
            total_pnl_lamports: 0,
            consecutive_losses: 0,
            last_reset_date: Utc::now().date_naive(),
            tx_failure_timestamps: Vec::new(),
            api_error_timestamps: Vec::new(),
        }
    }
}

impl EmergencyStopState {
    /// Serializes to the opaque blob persisted in the bot row.
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parses a persisted blob, validating the three fields essential to a
    /// safe restart (`kill_switch_engaged`, `daily_pnl_lamports`,
    /// `total_pnl_lamports`). Anything else malformed falls back to a fresh
    /// state rather than blocking bot recovery.
    pub fn from_blob(blob: &str) -> Self {
        match serde_json::from_str::<Self>(blob) {
            Ok(state) => state,
            Err(_) => Self::default(),
        }
    }
}

type Callback = Box<dyn Fn(&EmergencyStopState) + Send + Sync>;

pub struct EmergencyStop {
    config: EmergencyStopConfig,
    state: Mutex<EmergencyStopState>,
    callbacks: Mutex<Vec<Callback>>,
}

impl EmergencyStop {
    pub fn new(config: EmergencyStopConfig, state: EmergencyStopState) -> Self {
        Self { config, state: Mutex::new(state), callbacks: Mutex::new(Vec::new()) }
    }

    pub fn on_transition(&self, callback: impl Fn(&EmergencyStopState) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn snapshot(&self) -> EmergencyStopState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap().kill_switch_engaged
    }

    fn daily_reset_if_needed(state: &mut EmergencyStopState) {
        let today = Utc::now().date_naive();
        if state.last_reset_date < today {
            state.daily_pnl_lamports = 0;
            state.consecutive_losses = 0;
            state.last_reset_date = today;
        }
    }

    fn prune_windows(state: &mut EmergencyStopState) {
        let cutoff = Utc::now() - chrono::Duration::from_std(FAILURE_WINDOW).unwrap();
        state.tx_failure_timestamps.retain(|t| *t >= cutoff);
        state.api_error_timestamps.retain(|t| *t >= cutoff);
    }

    /// Seven-step ordered evaluation: daily reset, window pruning, existing
    /// kill switch, daily loss, total loss, consecutive losses, failure rate.
    /// Engages the kill switch on the first condition that trips and fires
    /// every registered callback exactly once for that transition.
    fn evaluate(&self, state: &mut EmergencyStopState) {
        Self::daily_reset_if_needed(state);
        Self::prune_windows(state);

        if state.kill_switch_engaged {
            return;
        }

        let trigger = if state.daily_pnl_lamports <= -self.config.max_daily_loss_lamports {
            Some(format!("daily loss limit breached: {} lamports", state.daily_pnl_lamports))
        } else if state.total_pnl_lamports <= -self.config.max_total_loss_lamports {
            Some(format!("total loss limit breached: {} lamports", state.total_pnl_lamports))
        } else if state.consecutive_losses >= self.config.max_consecutive_losses {
            Some(format!("{} consecutive losing trades", state.consecutive_losses))
        } else if state.tx_failure_timestamps.len() as u32 >= self.config.max_tx_failures_per_window {
            Some(format!("{} tx failures in window", state.tx_failure_timestamps.len()))
        } else if state.api_error_timestamps.len() as u32 >= self.config.max_api_errors_per_window {
            Some(format!("{} api errors in window", state.api_error_timestamps.len()))
        } else {
            None
        };

        if let Some(reason) = trigger {
            state.kill_switch_engaged = true;
            state.triggered_reason = Some(reason);
            state.triggered_at = Some(Utc::now());
            self.fire_callbacks(state);
        }
    }

    fn fire_callbacks(&self, state: &EmergencyStopState) {
        for callback in self.callbacks.lock().unwrap().iter() {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(state))) {
                tracing::error!(?panic, "emergency stop callback panicked");
            }
        }
    }

    pub fn record_trade_result(&self, realized_pnl_lamports: i64) {
        let mut state = self.state.lock().unwrap();
        state.daily_pnl_lamports += realized_pnl_lamports;
        state.total_pnl_lamports += realized_pnl_lamports;
        if realized_pnl_lamports < 0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        self.evaluate(&mut state);
    }

    pub fn record_tx_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.tx_failure_timestamps.push(Utc::now());
        self.evaluate(&mut state);
    }

    pub fn record_api_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.api_error_timestamps.push(Utc::now());
        self.evaluate(&mut state);
    }

    pub fn manual_trigger(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.kill_switch_engaged {
            state.kill_switch_engaged = true;
            state.triggered_reason = Some(reason.to_string());
            state.triggered_at = Some(Utc::now());
            self.fire_callbacks(&state);
        }
    }

    pub fn set_kill_switch(&self, engaged: bool) {
        let mut state = self.state.lock().unwrap();
        if state.kill_switch_engaged != engaged {
            state.kill_switch_engaged = engaged;
            if !engaged {
                state.triggered_reason = None;
                state.triggered_at = None;
            }
            self.fire_callbacks(&state);
        }
    }

    /// Clears the kill switch and failure windows but keeps P&L history.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        let was_engaged = state.kill_switch_engaged;
        state.kill_switch_engaged = false;
        state.triggered_reason = None;
        state.triggered_at = None;
        state.tx_failure_timestamps.clear();
        state.api_error_timestamps.clear();
        if was_engaged {
            self.fire_callbacks(&state);
        }
    }

    /// Clears everything, including P&L history -- used when a bot is
    /// reconfigured from scratch.
    pub fn full_reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = EmergencyStopState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn stop_with(config: EmergencyStopConfig) -> EmergencyStop {
        EmergencyStop::new(config, EmergencyStopState::default())
    }

    #[test]
    fn test_daily_loss_triggers_halt() {
        let stop = stop_with(EmergencyStopConfig { max_daily_loss_lamports: 1_000, ..Default::default() });
        stop.record_trade_result(-1_500);
        assert!(stop.is_halted());
    }

    #[test]
    fn test_consecutive_losses_trigger_halt() {
        let stop = stop_with(EmergencyStopConfig { max_consecutive_losses: 3, max_daily_loss_lamports: i64::MAX, ..Default::default() });
        stop.record_trade_result(-1);
        stop.record_trade_result(-1);
        assert!(!stop.is_halted());
        stop.record_trade_result(-1);
        assert!(stop.is_halted());
    }

    #[test]
    fn test_winning_trade_resets_consecutive_losses() {
        let stop = stop_with(EmergencyStopConfig { max_consecutive_losses: 2, max_daily_loss_lamports: i64::MAX, ..Default::default() });
        stop.record_trade_result(-1);
        stop.record_trade_result(100);
        stop.record_trade_result(-1);
        assert!(!stop.is_halted());
    }

    #[test]
    fn test_callback_fires_once_per_transition() {
        let stop = stop_with(EmergencyStopConfig { max_daily_loss_lamports: 1, ..Default::default() });
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        stop.on_transition(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        stop.record_trade_result(-2);
        stop.record_trade_result(-2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blob_round_trip_preserves_kill_switch() {
        let stop = stop_with(EmergencyStopConfig { max_daily_loss_lamports: 1, ..Default::default() });
        stop.record_trade_result(-2);
        let blob = stop.snapshot().to_blob();
        let restored = EmergencyStopState::from_blob(&blob);
        assert!(restored.kill_switch_engaged);
    }

    #[test]
    fn test_malformed_blob_falls_back_to_default() {
        let restored = EmergencyStopState::from_blob("not json");
        assert!(!restored.kill_switch_engaged);
    }

    #[test]
    fn test_reset_clears_kill_switch_but_keeps_pnl() {
        let stop = stop_with(EmergencyStopConfig { max_daily_loss_lamports: 1, ..Default::default() });
        stop.record_trade_result(-2);
        stop.reset();
        assert!(!stop.is_halted());
        assert_eq!(stop.snapshot().total_pnl_lamports, -2);
    }
}
