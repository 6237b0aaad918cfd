//! Live trading backend. Every open/close routes through the wallet's chain
//! client; cryptographic signing and the on-chain instruction format are an
//! external collaborator's concern, not this crate's -- `ChainClient` models
//! only the contract the engine needs from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::executor::{Executor, PerformanceSummary, PositionStatus, TrackedPosition};
use crate::safety::circuit_breaker::CircuitBreaker;
use crate::safety::emergency_stop::EmergencyStop;

const DUST_THRESHOLD_LAMPORTS: i64 = 1_000;

/// The on-chain side of opening/closing a DLMM position. A real
/// implementation signs and submits transactions through the wallet's RPC
/// client; tests and the simulation-to-live boundary use a fake.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn wallet_balance_lamports(&self) -> AppResult<i64>;

    async fn send_open_tx(
        &self,
        pool_address: &str,
        bin_id: i32,
        amount_x_lamports: i64,
        amount_y_lamports: i64,
    ) -> AppResult<OpenTxReceipt>;

    async fn send_close_tx(&self, position: &TrackedPosition) -> AppResult<CloseTxReceipt>;

    /// Swaps any dust left over from an uneven close back into the quote
    /// asset. Failures here are logged and swallowed -- leftover dust never
    /// blocks a close from completing.
    async fn swap_leftover(&self, mint: &str, amount_lamports: i64) -> AppResult<()>;
}

pub struct OpenTxReceipt {
    pub filled_amount_x_lamports: i64,
    pub filled_amount_y_lamports: i64,
    pub tx_fee_lamports: i64,
}

pub struct CloseTxReceipt {
    pub amount_x_lamports: i64,
    pub amount_y_lamports: i64,
    pub tx_fee_lamports: i64,
    pub fee_earned_lamports: i64,
    pub leftover_mint: Option<String>,
    pub leftover_amount_lamports: i64,
}

pub struct LiveExecutor {
    chain: Arc<dyn ChainClient>,
    emergency_stop: Arc<EmergencyStop>,
    circuit_breaker: Arc<CircuitBreaker>,
    positions: Mutex<HashMap<String, TrackedPosition>>,
}

impl LiveExecutor {
    pub fn new(chain: Arc<dyn ChainClient>, emergency_stop: Arc<EmergencyStop>, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        Self { chain, emergency_stop, circuit_breaker, positions: Mutex::new(HashMap::new()) }
    }

    /// Gate order before any capital moves: emergency stop first (a halted
    /// bot never trades no matter the circuit breaker state), then the
    /// circuit breaker, then a live balance check.
    async fn check_gates(&self, pool_address: &str, requested_lamports: i64) -> AppResult<()> {
        if self.emergency_stop.is_halted() {
            return Err(AppError::SafetyHalt("emergency stop engaged".to_string()));
        }
        self.circuit_breaker
            .can_open(pool_address, requested_lamports)
            .map_err(AppError::SafetyHalt)?;

        let balance = self.chain.wallet_balance_lamports().await?;
        if balance < requested_lamports {
            return Err(AppError::BusinessRule(format!("wallet balance {balance} below requested {requested_lamports}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Executor for LiveExecutor {
    async fn open(
        &self,
        bot_id: &str,
        pool_address: &str,
        bin_id: i32,
        price_per_token: f64,
        amount_x_lamports: i64,
        amount_y_lamports: i64,
    ) -> AppResult<TrackedPosition> {
        let requested = amount_x_lamports + amount_y_lamports;
        if let Err(err) = self.check_gates(pool_address, requested).await {
            if matches!(err, AppError::ExternalUnavailable(_)) {
                self.emergency_stop.record_api_error();
            }
            return Err(err);
        }

        // Preserve the X:Y ratio when the chain fills less than requested --
        // a partial fill never leaves the position lopsided.
        let receipt = match self.chain.send_open_tx(pool_address, bin_id, amount_x_lamports, amount_y_lamports).await {
            Ok(receipt) => receipt,
            Err(err) => {
                self.emergency_stop.record_tx_failure();
                return Err(err);
            }
        };

        let ratio = if amount_x_lamports > 0 { amount_y_lamports as f64 / amount_x_lamports as f64 } else { 0.0 };
        let filled_x = receipt.filled_amount_x_lamports;
        let filled_y = if ratio > 0.0 { (filled_x as f64 * ratio) as i64 } else { receipt.filled_amount_y_lamports };

        let position = TrackedPosition {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            pool_address: pool_address.to_string(),
            status: PositionStatus::Active,
            entry_bin_id: bin_id,
            entry_price_per_token: price_per_token,
            entry_amount_x_lamports: filled_x,
            entry_amount_y_lamports: filled_y,
            entry_tx_fee_lamports: receipt.tx_fee_lamports,
            opened_at: Utc::now(),
            current_price_per_token: price_per_token,
            current_bin_id: bin_id,
            unrealized_pnl_lamports: 0,
            fee_earned_lamports: 0,
            exit_price_per_token: None,
            exit_amount_x_lamports: None,
            exit_amount_y_lamports: None,
            exit_tx_fee_lamports: None,
            realized_pnl_lamports: None,
            closed_at: None,
            close_reason: None,
        };

        self.positions.lock().unwrap().insert(position.id.clone(), position.clone());
        self.circuit_breaker.record_position_opened(pool_address, filled_x + filled_y);
        Ok(position)
    }

    async fn close(&self, position_id: &str, reason: &str) -> AppResult<TrackedPosition> {
        let position = {
            let positions = self.positions.lock().unwrap();
            positions.get(position_id).cloned().ok_or_else(|| AppError::NotFound(format!("position {position_id} not found")))?
        };
        if !position.status.can_transition_to(PositionStatus::Closing) {
            return Err(AppError::BusinessRule(format!("position {position_id} is not open")));
        }

        let receipt = match self.chain.send_close_tx(&position).await {
            Ok(receipt) => receipt,
            Err(err) => {
                self.emergency_stop.record_tx_failure();
                return Err(err);
            }
        };

        if let Some(mint) = &receipt.leftover_mint {
            if receipt.leftover_amount_lamports > DUST_THRESHOLD_LAMPORTS {
                if let Err(err) = self.chain.swap_leftover(mint, receipt.leftover_amount_lamports).await {
                    tracing::warn!(error = %err, %mint, "leftover swap failed, proceeding with close");
                }
            }
        }

        let fee_earned = receipt.fee_earned_lamports.max(position.fee_earned_lamports);
        let realized_pnl = (receipt.amount_x_lamports + receipt.amount_y_lamports + fee_earned)
            - (position.entry_amount_x_lamports + position.entry_amount_y_lamports)
            - position.entry_tx_fee_lamports
            - receipt.tx_fee_lamports;

        let mut positions = self.positions.lock().unwrap();
        let position = positions.get_mut(position_id).unwrap();
        position.status = PositionStatus::Closed;
        position.exit_amount_x_lamports = Some(receipt.amount_x_lamports);
        position.exit_amount_y_lamports = Some(receipt.amount_y_lamports);
        position.exit_tx_fee_lamports = Some(receipt.tx_fee_lamports);
        position.fee_earned_lamports = fee_earned;
        position.realized_pnl_lamports = Some(realized_pnl);
        position.exit_price_per_token = Some(position.current_price_per_token);
        position.closed_at = Some(Utc::now());
        position.close_reason = Some(reason.to_string());

        let closed = position.clone();
        drop(positions);
        self.circuit_breaker.record_position_closed(&closed.pool_address, closed.entry_amount_x_lamports + closed.entry_amount_y_lamports);
        Ok(closed)
    }

    async fn update(&self, position_id: &str, current_price_per_token: f64, current_bin_id: i32) -> AppResult<TrackedPosition> {
        let mut positions = self.positions.lock().unwrap();
        let position = positions.get_mut(position_id).ok_or_else(|| AppError::NotFound(format!("position {position_id} not found")))?;
        let notional = (position.entry_amount_x_lamports + position.entry_amount_y_lamports) as f64;
        let drift = if position.entry_price_per_token > 0.0 {
            (current_price_per_token - position.entry_price_per_token) / position.entry_price_per_token
        } else {
            0.0
        };
        position.current_price_per_token = current_price_per_token;
        position.current_bin_id = current_bin_id;
        position.unrealized_pnl_lamports = (notional * drift) as i64;
        Ok(position.clone())
    }

    async fn active_positions(&self, bot_id: &str) -> AppResult<Vec<TrackedPosition>> {
        let positions = self.positions.lock().unwrap();
        Ok(positions.values().filter(|p| p.bot_id == bot_id && p.status == PositionStatus::Active).cloned().collect())
    }

    async fn balance(&self, _bot_id: &str) -> AppResult<i64> {
        self.chain.wallet_balance_lamports().await
    }

    async fn performance_summary(&self, bot_id: &str) -> AppResult<PerformanceSummary> {
        let positions = self.positions.lock().unwrap();
        let mut summary = PerformanceSummary::default();
        for position in positions.values().filter(|p| p.bot_id == bot_id) {
            match position.status {
                PositionStatus::Active => {
                    summary.open_positions += 1;
                    summary.total_unrealized_pnl_lamports += position.unrealized_pnl_lamports;
                }
                PositionStatus::Closed => {
                    let pnl = position.realized_pnl_lamports.unwrap_or(0);
                    summary.total_realized_pnl_lamports += pnl;
                    if pnl >= 0 {
                        summary.win_count += 1;
                    } else {
                        summary.loss_count += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::circuit_breaker::CircuitBreakerConfig;
    use crate::safety::emergency_stop::{EmergencyStopConfig, EmergencyStopState};

    struct FakeChain {
        balance: i64,
    }

    #[async_trait::async_trait]
    impl ChainClient for FakeChain {
        async fn wallet_balance_lamports(&self) -> AppResult<i64> {
            Ok(self.balance)
        }
        async fn send_open_tx(&self, _pool: &str, _bin: i32, x: i64, y: i64) -> AppResult<OpenTxReceipt> {
            Ok(OpenTxReceipt { filled_amount_x_lamports: x, filled_amount_y_lamports: y, tx_fee_lamports: 5_000 })
        }
        async fn send_close_tx(&self, position: &TrackedPosition) -> AppResult<CloseTxReceipt> {
            Ok(CloseTxReceipt {
                amount_x_lamports: position.entry_amount_x_lamports,
                amount_y_lamports: position.entry_amount_y_lamports,
                tx_fee_lamports: 5_000,
                fee_earned_lamports: 1_000,
                leftover_mint: None,
                leftover_amount_lamports: 0,
            })
        }
        async fn swap_leftover(&self, _mint: &str, _amount: i64) -> AppResult<()> {
            Ok(())
        }
    }

    fn executor(balance: i64) -> LiveExecutor {
        LiveExecutor::new(
            Arc::new(FakeChain { balance }),
            Arc::new(EmergencyStop::new(EmergencyStopConfig::default(), EmergencyStopState::default())),
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_open_rejects_when_balance_too_low() {
        let exec = executor(100);
        let result = exec.open("bot-1", "pool-1", 5, 1.0, 1_000_000, 1_000_000).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_then_close_records_trade_result() {
        let exec = executor(10_000_000_000);
        let position = exec.open("bot-1", "pool-1", 5, 1.0, 1_000_000, 1_000_000).await.unwrap();
        let closed = exec.close(&position.id, "take_profit").await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.realized_pnl_lamports.is_some());
    }

    #[tokio::test]
    async fn test_halted_emergency_stop_blocks_open() {
        let stop = Arc::new(EmergencyStop::new(EmergencyStopConfig::default(), EmergencyStopState::default()));
        stop.manual_trigger("test halt");
        let exec = LiveExecutor::new(
            Arc::new(FakeChain { balance: 10_000_000_000 }),
            stop,
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        );
        let result = exec.open("bot-1", "pool-1", 5, 1.0, 1_000_000, 1_000_000).await;
        assert!(matches!(result, Err(AppError::SafetyHalt(_))));
    }
}
