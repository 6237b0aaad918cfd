pub mod live;
pub mod simulation;

use serde::{Deserialize, Serialize};

use crate::errors::AppResult;

/// Lifecycle of a tracked position. Transitions are monotonic: `Pending` can
/// only move forward, never back to `Pending`, and `Closed`/`Error` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Active,
    Closing,
    Closed,
    Error,
}

impl PositionStatus {
    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (Pending, Active) | (Pending, Error) => true,
            (Active, Closing) | (Active, Error) => true,
            (Closing, Closed) | (Closing, Error) => true,
            (same, other) if same == other => true,
            _ => false,
        }
    }
}

/// A single liquidity position opened by a bot engine. Mirrors the
/// `positions` table row one-to-one; `f64` fields are display/derived only,
/// every lamport amount is an `i64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub id: String,
    pub bot_id: String,
    pub pool_address: String,
    pub status: PositionStatus,

    pub entry_bin_id: i32,
    pub entry_price_per_token: f64,
    pub entry_amount_x_lamports: i64,
    pub entry_amount_y_lamports: i64,
    pub entry_tx_fee_lamports: i64,
    pub opened_at: chrono::DateTime<chrono::Utc>,

    pub current_price_per_token: f64,
    pub current_bin_id: i32,
    pub unrealized_pnl_lamports: i64,
    pub fee_earned_lamports: i64,

    pub exit_price_per_token: Option<f64>,
    pub exit_amount_x_lamports: Option<i64>,
    pub exit_amount_y_lamports: Option<i64>,
    pub exit_tx_fee_lamports: Option<i64>,
    pub realized_pnl_lamports: Option<i64>,
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub close_reason: Option<String>,
}

/// Summary of a bot's overall standing across its positions, reported in
/// engine stats and the checkpoint events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub open_positions: usize,
    pub total_realized_pnl_lamports: i64,
    pub total_unrealized_pnl_lamports: i64,
    pub win_count: u32,
    pub loss_count: u32,
}

/// Everything a bot engine needs from a trade backend, whether that backend
/// is a paper-trading simulator or a live wallet talking to the chain.
/// Keeping both behind one trait means the engine's scan/entry/exit logic
/// never branches on simulation vs. live.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn open(
        &self,
        bot_id: &str,
        pool_address: &str,
        bin_id: i32,
        price_per_token: f64,
        amount_x_lamports: i64,
        amount_y_lamports: i64,
    ) -> AppResult<TrackedPosition>;

    async fn close(&self, position_id: &str, reason: &str) -> AppResult<TrackedPosition>;

    async fn update(&self, position_id: &str, current_price_per_token: f64, current_bin_id: i32) -> AppResult<TrackedPosition>;

    async fn active_positions(&self, bot_id: &str) -> AppResult<Vec<TrackedPosition>>;

    async fn balance(&self, bot_id: &str) -> AppResult<i64>;

    async fn performance_summary(&self, bot_id: &str) -> AppResult<PerformanceSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_cannot_skip_to_closing() {
        assert!(!PositionStatus::Pending.can_transition_to(PositionStatus::Closing));
    }

    #[test]
    fn test_terminal_states_reject_forward_motion() {
        assert!(!PositionStatus::Closed.can_transition_to(PositionStatus::Active));
        assert!(!PositionStatus::Error.can_transition_to(PositionStatus::Active));
    }

    #[test]
    fn test_legal_forward_chain() {
        assert!(PositionStatus::Pending.can_transition_to(PositionStatus::Active));
        assert!(PositionStatus::Active.can_transition_to(PositionStatus::Closing));
        assert!(PositionStatus::Closing.can_transition_to(PositionStatus::Closed));
    }
}
