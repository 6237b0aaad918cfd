//! Persistence layer. A single writer task owns the rusqlite connection and
//! drains commands off a bounded channel -- it is the only code in the
//! process that ever calls a mutating statement. Cold-path reads (HTTP GETs,
//! startup recovery) lock the shared connection directly instead of
//! round-tripping through the writer, the same split the teacher's db module
//! uses.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{AppError, AppResult};
use crate::events::BotEvent;

pub type DbPool = Arc<Mutex<Connection>>;

pub fn init_db(data_dir: &Path) -> AppResult<DbPool> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("bots.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000; PRAGMA foreign_keys=ON;")?;

    let schema = include_str!("../migrations/001_init.sql");
    conn.execute_batch(schema)?;

    tracing::info!(path = %db_path.display(), "database initialized");
    Ok(Arc::new(Mutex::new(conn)))
}

fn init_in_memory() -> AppResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(include_str!("../migrations/001_init.sql"))?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[derive(Debug)]
pub enum DbCommand {
    InsertBot { bot_id: String, user_id: String, name: String, strategy_mode: String, config_json: String },
    SetBotRunning { bot_id: String, running: bool },
    SetBotLastError { bot_id: String, error: Option<String> },
    UpdateEmergencyStopState { bot_id: String, state_blob: String },
    UpsertPosition { position: crate::executor::TrackedPosition },
    InsertTradeLog { bot_id: String, position_id: Option<String>, kind: String, detail_json: String },
    ListRunningBotIds { reply: oneshot::Sender<AppResult<Vec<String>>> },
    UpdateBotConfig { bot_id: String, name: String, strategy_mode: String, config_json: String },
    DeleteBot { bot_id: String },
    InsertPreset { preset_id: String, user_id: Option<String>, name: String, description: String, config_json: String },
    UpdatePositionCheckpoint { position_id: String, current_price_per_token: f64, unrealized_pnl_lamports: i64 },
}

/// Dedicated DB writer task -- the only task that touches the connection for
/// mutations. Read commands still flow through here when the caller needs a
/// result back (e.g. startup recovery); simple cold reads go straight to
/// `DbHandle`'s direct-lock helpers instead.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");
    while let Some(cmd) = rx.recv().await {
        if let Err(err) = execute_command(&db, cmd) {
            tracing::error!(error = %err, "db write failed");
        }
    }
    tracing::info!("db writer task shutting down");
}

fn execute_command(db: &DbPool, cmd: DbCommand) -> AppResult<()> {
    let conn = db.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;

    match cmd {
        DbCommand::InsertBot { bot_id, user_id, name, strategy_mode, config_json } => {
            // User identity itself is owned by an external collaborator (see
            // `server::auth`); ensure a row exists so the bot's foreign key
            // is satisfied without this crate ever managing accounts.
            conn.execute(
                "INSERT OR IGNORE INTO users (id, email) VALUES (?1, ?2)",
                rusqlite::params![user_id, format!("{user_id}@bearer.local")],
            )?;
            conn.execute(
                "INSERT INTO bots (id, user_id, name, strategy_mode, config_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![bot_id, user_id, name, strategy_mode, config_json],
            )?;
        }
        DbCommand::SetBotRunning { bot_id, running } => {
            conn.execute(
                "UPDATE bots SET is_running = ?1, updated_at = datetime('now') WHERE id = ?2",
                rusqlite::params![running as i64, bot_id],
            )?;
        }
        DbCommand::SetBotLastError { bot_id, error } => {
            conn.execute(
                "UPDATE bots SET last_error = ?1, updated_at = datetime('now') WHERE id = ?2",
                rusqlite::params![error, bot_id],
            )?;
        }
        DbCommand::UpdateEmergencyStopState { bot_id, state_blob } => {
            conn.execute(
                "UPDATE bots SET emergency_stop_state = ?1, updated_at = datetime('now') WHERE id = ?2",
                rusqlite::params![state_blob, bot_id],
            )?;
        }
        DbCommand::UpsertPosition { position } => {
            conn.execute(
                "INSERT INTO positions (
                    id, bot_id, pool_address, status, entry_bin_id, entry_price_per_token,
                    entry_amount_x_lamports, entry_amount_y_lamports, entry_tx_fee_lamports, opened_at,
                    current_price_per_token, current_bin_id, unrealized_pnl_lamports, fee_earned_lamports,
                    exit_price_per_token, exit_amount_x_lamports, exit_amount_y_lamports, exit_tx_fee_lamports,
                    realized_pnl_lamports, closed_at, close_reason
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    current_price_per_token = excluded.current_price_per_token,
                    current_bin_id = excluded.current_bin_id,
                    unrealized_pnl_lamports = excluded.unrealized_pnl_lamports,
                    fee_earned_lamports = excluded.fee_earned_lamports,
                    exit_price_per_token = excluded.exit_price_per_token,
                    exit_amount_x_lamports = excluded.exit_amount_x_lamports,
                    exit_amount_y_lamports = excluded.exit_amount_y_lamports,
                    exit_tx_fee_lamports = excluded.exit_tx_fee_lamports,
                    realized_pnl_lamports = excluded.realized_pnl_lamports,
                    closed_at = excluded.closed_at,
                    close_reason = excluded.close_reason",
                rusqlite::params![
                    position.id,
                    position.bot_id,
                    position.pool_address,
                    format!("{:?}", position.status).to_lowercase(),
                    position.entry_bin_id,
                    position.entry_price_per_token,
                    position.entry_amount_x_lamports,
                    position.entry_amount_y_lamports,
                    position.entry_tx_fee_lamports,
                    position.opened_at.to_rfc3339(),
                    position.current_price_per_token,
                    position.current_bin_id,
                    position.unrealized_pnl_lamports,
                    position.fee_earned_lamports,
                    position.exit_price_per_token,
                    position.exit_amount_x_lamports,
                    position.exit_amount_y_lamports,
                    position.exit_tx_fee_lamports,
                    position.realized_pnl_lamports,
                    position.closed_at.map(|t| t.to_rfc3339()),
                    position.close_reason,
                ],
            )?;
        }
        DbCommand::InsertTradeLog { bot_id, position_id, kind, detail_json } => {
            conn.execute(
                "INSERT INTO trade_log (bot_id, position_id, kind, detail_json) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![bot_id, position_id, kind, detail_json],
            )?;
        }
        DbCommand::ListRunningBotIds { reply } => {
            let result = list_running_bot_ids_inner(&conn);
            let _ = reply.send(result);
        }
        DbCommand::UpdateBotConfig { bot_id, name, strategy_mode, config_json } => {
            conn.execute(
                "UPDATE bots SET name = ?1, strategy_mode = ?2, config_json = ?3, updated_at = datetime('now')
                 WHERE id = ?4 AND is_running = 0",
                rusqlite::params![name, strategy_mode, config_json, bot_id],
            )?;
        }
        DbCommand::DeleteBot { bot_id } => {
            // `ON DELETE CASCADE` on positions/trade_log takes care of the
            // rest; the `is_running = 0` guard keeps a bot whose stop raced
            // with this delete from losing its engine mid-flight.
            conn.execute("DELETE FROM bots WHERE id = ?1 AND is_running = 0", rusqlite::params![bot_id])?;
        }
        DbCommand::InsertPreset { preset_id, user_id, name, description, config_json } => {
            conn.execute(
                "INSERT INTO strategy_presets (id, user_id, name, description, is_system, config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![preset_id, user_id, name, description, user_id.is_none() as i64, config_json],
            )?;
        }
        DbCommand::UpdatePositionCheckpoint { position_id, current_price_per_token, unrealized_pnl_lamports } => {
            conn.execute(
                "UPDATE positions SET current_price_per_token = ?1, unrealized_pnl_lamports = ?2 WHERE id = ?3",
                rusqlite::params![current_price_per_token, unrealized_pnl_lamports, position_id],
            )?;
        }
    }
    Ok(())
}

fn list_running_bot_ids_inner(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM bots WHERE is_running = 1")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Handle every collaborator (engine, orchestrator, HTTP routes) holds to
/// reach the database -- cheap to clone, since it's just a sender and an
/// `Arc` underneath.
#[derive(Clone)]
pub struct DbHandle {
    pool: DbPool,
    tx: mpsc::Sender<DbCommand>,
}

impl DbHandle {
    pub fn new(pool: DbPool, tx: mpsc::Sender<DbCommand>) -> Self {
        Self { pool, tx }
    }

    #[cfg(test)]
    pub fn in_memory_for_tests() -> AppResult<Self> {
        let pool = init_in_memory()?;
        let (tx, mut rx) = mpsc::channel(64);
        let pool_for_writer = pool.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let _ = execute_command(&pool_for_writer, cmd);
            }
        });
        Ok(Self { pool, tx })
    }

    async fn send(&self, cmd: DbCommand) -> AppResult<()> {
        self.tx.send(cmd).await.map_err(|_| AppError::ChannelClosed("db writer channel closed".to_string()))
    }

    pub async fn insert_bot(&self, bot_id: &str, user_id: &str, name: &str, strategy_mode: &str, config_json: String) -> AppResult<()> {
        self.send(DbCommand::InsertBot {
            bot_id: bot_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            strategy_mode: strategy_mode.to_string(),
            config_json,
        })
        .await
    }

    pub async fn set_bot_running(&self, bot_id: &str, running: bool) -> AppResult<()> {
        self.send(DbCommand::SetBotRunning { bot_id: bot_id.to_string(), running }).await
    }

    pub async fn set_bot_last_error(&self, bot_id: &str, error: Option<String>) -> AppResult<()> {
        self.send(DbCommand::SetBotLastError { bot_id: bot_id.to_string(), error }).await
    }

    pub async fn update_emergency_stop_state(&self, bot_id: &str, state_blob: String) -> AppResult<()> {
        self.send(DbCommand::UpdateEmergencyStopState { bot_id: bot_id.to_string(), state_blob }).await
    }

    pub async fn upsert_position(&self, position: crate::executor::TrackedPosition) -> AppResult<()> {
        self.send(DbCommand::UpsertPosition { position }).await
    }

    pub async fn insert_trade_log(&self, bot_id: &str, position_id: Option<String>, kind: &str, detail_json: String) -> AppResult<()> {
        self.send(DbCommand::InsertTradeLog { bot_id: bot_id.to_string(), position_id, kind: kind.to_string(), detail_json }).await
    }

    pub async fn list_running_bot_ids(&self) -> AppResult<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DbCommand::ListRunningBotIds { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| AppError::ChannelClosed("db writer dropped reply channel".to_string()))?
    }

    pub async fn update_bot_config(&self, bot_id: &str, name: &str, strategy_mode: &str, config_json: String) -> AppResult<()> {
        self.send(DbCommand::UpdateBotConfig {
            bot_id: bot_id.to_string(),
            name: name.to_string(),
            strategy_mode: strategy_mode.to_string(),
            config_json,
        })
        .await
    }

    pub async fn delete_bot(&self, bot_id: &str) -> AppResult<()> {
        self.send(DbCommand::DeleteBot { bot_id: bot_id.to_string() }).await
    }

    pub async fn insert_preset(&self, preset_id: &str, user_id: Option<String>, name: &str, description: &str, config_json: String) -> AppResult<()> {
        self.send(DbCommand::InsertPreset {
            preset_id: preset_id.to_string(),
            user_id,
            name: name.to_string(),
            description: description.to_string(),
            config_json,
        })
        .await
    }

    /// Persists one bot event into the trade log / position table as
    /// appropriate. `EngineStarted`/`EngineStopped`/`EngineError`/
    /// `ScanCompleted` are log-only; position events additionally upsert the
    /// `positions` row so it always reflects the engine's latest view.
    pub async fn persist_event(&self, bot_id: &str, event: &BotEvent) -> AppResult<()> {
        use crate::events::EventPayload;

        match &event.payload {
            EventPayload::PositionOpened { position } | EventPayload::PositionClosed { position } => {
                self.upsert_position((**position).clone()).await?;
            }
            EventPayload::PositionUpdated { position_id, current_price_per_token, unrealized_pnl_lamports } => {
                self.send(DbCommand::UpdatePositionCheckpoint {
                    position_id: position_id.clone(),
                    current_price_per_token: *current_price_per_token,
                    unrealized_pnl_lamports: *unrealized_pnl_lamports,
                })
                .await?;
            }
            _ => {}
        }

        let detail_json = serde_json::to_string(&event.payload)?;
        self.insert_trade_log(bot_id, position_id_of(&event.payload), event.payload.kind(), detail_json).await
    }

    // ── cold-path reads: lock the shared connection directly ──

    pub fn get_bot_row(&self, bot_id: &str) -> AppResult<Option<BotRow>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let result = conn.query_row(
            "SELECT id, user_id, name, strategy_mode, config_json, is_running, emergency_stop_state, last_error
             FROM bots WHERE id = ?1",
            rusqlite::params![bot_id],
            |row| {
                Ok(BotRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    strategy_mode: row.get(3)?,
                    config_json: row.get(4)?,
                    is_running: row.get::<_, i64>(5)? != 0,
                    emergency_stop_state: row.get(6)?,
                    last_error: row.get(7)?,
                })
            },
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_positions(&self, bot_id: &str) -> AppResult<Vec<crate::executor::TrackedPosition>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, pool_address, status, entry_bin_id, entry_price_per_token,
                    entry_amount_x_lamports, entry_amount_y_lamports, entry_tx_fee_lamports, opened_at,
                    current_price_per_token, current_bin_id, unrealized_pnl_lamports, fee_earned_lamports,
                    exit_price_per_token, exit_amount_x_lamports, exit_amount_y_lamports, exit_tx_fee_lamports,
                    realized_pnl_lamports, closed_at, close_reason
             FROM positions WHERE bot_id = ?1 ORDER BY opened_at DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![bot_id], row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_bots_for_user(&self, user_id: &str) -> AppResult<Vec<BotRow>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, strategy_mode, config_json, is_running, emergency_stop_state, last_error
             FROM bots WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], row_to_bot)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_bots_for_user(&self, user_id: &str) -> AppResult<i64> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        conn.query_row("SELECT COUNT(*) FROM bots WHERE user_id = ?1", rusqlite::params![user_id], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Every active position belonging to one of this user's bots, joined
    /// through `bots` rather than a denormalised `user_id` column on
    /// `positions` -- the bot relationship is the single source of truth for
    /// ownership.
    pub fn list_active_positions_for_user(&self, user_id: &str) -> AppResult<Vec<crate::executor::TrackedPosition>> {
        self.list_positions_for_user_by_status(user_id, &["pending", "active", "closing"], true)
    }

    pub fn list_position_history_for_user(&self, user_id: &str) -> AppResult<Vec<crate::executor::TrackedPosition>> {
        self.list_positions_for_user_by_status(user_id, &["closed", "error"], false)
    }

    fn list_positions_for_user_by_status(&self, user_id: &str, statuses: &[&str], newest_first_by_open: bool) -> AppResult<Vec<crate::executor::TrackedPosition>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let placeholders = statuses.iter().enumerate().map(|(i, _)| format!("?{}", i + 2)).collect::<Vec<_>>().join(",");
        let order_col = if newest_first_by_open { "p.opened_at" } else { "p.closed_at" };
        let sql = format!(
            "SELECT p.id, p.bot_id, p.pool_address, p.status, p.entry_bin_id, p.entry_price_per_token,
                    p.entry_amount_x_lamports, p.entry_amount_y_lamports, p.entry_tx_fee_lamports, p.opened_at,
                    p.current_price_per_token, p.current_bin_id, p.unrealized_pnl_lamports, p.fee_earned_lamports,
                    p.exit_price_per_token, p.exit_amount_x_lamports, p.exit_amount_y_lamports, p.exit_tx_fee_lamports,
                    p.realized_pnl_lamports, p.closed_at, p.close_reason
             FROM positions p JOIN bots b ON p.bot_id = b.id
             WHERE b.user_id = ?1 AND p.status IN ({placeholders})
             ORDER BY {order_col} DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
        for s in statuses {
            params.push(s);
        }
        let rows = stmt.query_map(params.as_slice(), row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Single position lookup with its owning bot's `user_id`, so the route
    /// layer can enforce ownership without a second query.
    pub fn get_position_with_owner(&self, position_id: &str) -> AppResult<Option<(crate::executor::TrackedPosition, String)>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let result = conn.query_row(
            "SELECT p.id, p.bot_id, p.pool_address, p.status, p.entry_bin_id, p.entry_price_per_token,
                    p.entry_amount_x_lamports, p.entry_amount_y_lamports, p.entry_tx_fee_lamports, p.opened_at,
                    p.current_price_per_token, p.current_bin_id, p.unrealized_pnl_lamports, p.fee_earned_lamports,
                    p.exit_price_per_token, p.exit_amount_x_lamports, p.exit_amount_y_lamports, p.exit_tx_fee_lamports,
                    p.realized_pnl_lamports, p.closed_at, p.close_reason, b.user_id
             FROM positions p JOIN bots b ON p.bot_id = b.id WHERE p.id = ?1",
            rusqlite::params![position_id],
            |row| Ok((row_to_position(row)?, row.get::<_, String>(21)?)),
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_presets_for_user(&self, user_id: &str) -> AppResult<Vec<PresetRow>> {
        let conn = self.pool.lock().map_err(|_| AppError::Database("connection lock poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, description, is_system, config_json
             FROM strategy_presets WHERE user_id IS NULL OR user_id = ?1 ORDER BY is_system DESC, created_at DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], |row| {
            Ok(PresetRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                is_system: row.get::<_, i64>(4)? != 0,
                config_json: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_bot(row: &rusqlite::Row) -> rusqlite::Result<BotRow> {
    Ok(BotRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        strategy_mode: row.get(3)?,
        config_json: row.get(4)?,
        is_running: row.get::<_, i64>(5)? != 0,
        emergency_stop_state: row.get(6)?,
        last_error: row.get(7)?,
    })
}

fn position_id_of(payload: &crate::events::EventPayload) -> Option<String> {
    use crate::events::EventPayload;
    match payload {
        EventPayload::PositionOpened { position } | EventPayload::PositionClosed { position } => Some(position.id.clone()),
        EventPayload::PositionUpdated { position_id, .. } => Some(position_id.clone()),
        _ => None,
    }
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<crate::executor::TrackedPosition> {
    use crate::executor::PositionStatus;
    let status_str: String = row.get(3)?;
    let status = match status_str.as_str() {
        "pending" => PositionStatus::Pending,
        "active" => PositionStatus::Active,
        "closing" => PositionStatus::Closing,
        "closed" => PositionStatus::Closed,
        _ => PositionStatus::Error,
    };
    Ok(crate::executor::TrackedPosition {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        pool_address: row.get(2)?,
        status,
        entry_bin_id: row.get(4)?,
        entry_price_per_token: row.get(5)?,
        entry_amount_x_lamports: row.get(6)?,
        entry_amount_y_lamports: row.get(7)?,
        entry_tx_fee_lamports: row.get(8)?,
        opened_at: parse_rfc3339(row.get::<_, String>(9)?),
        current_price_per_token: row.get(10)?,
        current_bin_id: row.get(11)?,
        unrealized_pnl_lamports: row.get(12)?,
        fee_earned_lamports: row.get(13)?,
        exit_price_per_token: row.get(14)?,
        exit_amount_x_lamports: row.get(15)?,
        exit_amount_y_lamports: row.get(16)?,
        exit_tx_fee_lamports: row.get(17)?,
        realized_pnl_lamports: row.get(18)?,
        closed_at: row.get::<_, Option<String>>(19)?.map(parse_rfc3339),
        close_reason: row.get(20)?,
    })
}

fn parse_rfc3339(raw: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&chrono::Utc)).unwrap_or_else(|_| chrono::Utc::now())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BotRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub strategy_mode: String,
    pub config_json: String,
    pub is_running: bool,
    pub emergency_stop_state: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PresetRow {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub description: String,
    pub is_system: bool,
    pub config_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_bot_running_round_trip() {
        let db = DbHandle::in_memory_for_tests().unwrap();
        {
            let conn = db.pool.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, email) VALUES ('user-1', 'a@example.com')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bots (id, user_id, name, strategy_mode, config_json) VALUES ('bot-1', 'user-1', 'b', 'rule_based', '{}')",
                [],
            )
            .unwrap();
        }
        db.set_bot_running("bot-1", true).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let ids = db.list_running_bot_ids().await.unwrap();
        assert_eq!(ids, vec!["bot-1".to_string()]);
    }
}
