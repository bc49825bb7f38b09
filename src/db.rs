//! SQLite store for pair state, ladders, staged orders and locks
//!
//! Decimals are stored as TEXT. Every state-changing tick is written in one
//! transaction through `write_pair_state`, so a reload always sees the state
//! as of the last completed tick.

use crate::error::PersistenceError;
use crate::strategies::engine::{ModeState, PairState};
use crate::strategies::exit_ladder::ExitLadder;
use crate::types::{
    DepositRange, ExitThreshold, OrderSide, OrderSize, PairKey, PendingOrder, RunStatistics, StopState,
    TradeMode, TradeReason,
};
use crate::services::exchange::OrderAck;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, PersistenceError>;

/// Instance lock row for a pair
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub running: bool,
    pub pid: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A filled order, as shown by `status`
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub order_id: String,
    pub side: OrderSide,
    pub size: OrderSize,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) a database file
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        info!("[DB] Opened {}", path);

        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Private in-memory database, for tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // One connection that never recycles, or the database disappears
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS thresholds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                price TEXT NOT NULL,
                release_amount TEXT NOT NULL,
                released INTEGER NOT NULL DEFAULT 0,
                linked_order_id TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_thresholds_symbol ON thresholds(symbol)",
            r#"
            CREATE TABLE IF NOT EXISTS ladder (
                symbol TEXT PRIMARY KEY,
                sold TEXT NOT NULL DEFAULT '0'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS stop_state (
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                current_stop TEXT,
                armed INTEGER NOT NULL DEFAULT 0,
                anchor_price TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, mode)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deposit_rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                deposit_price TEXT NOT NULL,
                upper_bound TEXT NOT NULL,
                lower_bound TEXT NOT NULL,
                stop_armed INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS run_stats (
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                trades_executed INTEGER NOT NULL DEFAULT 0,
                base_volume TEXT NOT NULL DEFAULT '0',
                quote_volume TEXT NOT NULL DEFAULT '0',
                last_entry_price TEXT,
                last_exit_price TEXT,
                deposit_price TEXT,
                buy_count INTEGER NOT NULL DEFAULT 0,
                win_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, mode)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pending_orders (
                client_order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                side TEXT NOT NULL,
                size_unit TEXT NOT NULL,
                size TEXT NOT NULL,
                trigger_price TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (symbol, mode)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                order_id TEXT NOT NULL,
                client_order_id TEXT NOT NULL UNIQUE,
                side TEXT NOT NULL,
                size_unit TEXT NOT NULL,
                size TEXT NOT NULL,
                price TEXT NOT NULL,
                reason TEXT NOT NULL,
                filled_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pair_status (
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                halted_reason TEXT,
                setup TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, mode)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                running INTEGER NOT NULL DEFAULT 0,
                pid INTEGER,
                started_at TEXT,
                PRIMARY KEY (symbol, mode)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ==================== INSTANCE LOCKS ====================

    /// Claim the single-instance lock for a pair
    pub async fn acquire_lock(&self, key: &PairKey, pid: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, Option<i64>)> =
            sqlx::query_as("SELECT running, pid FROM instance_locks WHERE symbol = ? AND mode = ?")
                .bind(&key.symbol)
                .bind(key.mode.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((1, holder)) = row {
            return Err(PersistenceError::LockHeld {
                symbol: key.symbol.clone(),
                mode: key.mode.to_string(),
                pid: holder,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO instance_locks (symbol, mode, running, pid, started_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(symbol, mode) DO UPDATE SET
                running = 1, pid = excluded.pid, started_at = excluded.started_at
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(pid)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn release_lock(&self, key: &PairKey) -> Result<()> {
        sqlx::query("UPDATE instance_locks SET running = 0, pid = NULL WHERE symbol = ? AND mode = ?")
            .bind(&key.symbol)
            .bind(key.mode.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear a stale lock left by a dead process. Returns whether one was held.
    pub async fn reset_lock(&self, key: &PairKey) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE instance_locks SET running = 0, pid = NULL WHERE symbol = ? AND mode = ? AND running = 1",
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn lock_info(&self, key: &PairKey) -> Result<Option<LockInfo>> {
        let row: Option<(i64, Option<i64>, Option<String>)> =
            sqlx::query_as("SELECT running, pid, started_at FROM instance_locks WHERE symbol = ? AND mode = ?")
                .bind(&key.symbol)
                .bind(key.mode.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(running, pid, started_at)| {
            Ok(LockInfo {
                running: running != 0,
                pid,
                started_at: parse_opt_time("started_at", started_at)?,
            })
        })
        .transpose()
    }

    // ==================== LADDER SEEDING ====================

    pub async fn has_thresholds(&self, symbol: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thresholds WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    /// Seed (price, amount) rows unless the symbol already has a ladder.
    /// Returns whether anything was written.
    pub async fn seed_thresholds(&self, symbol: &str, rows: &[(Decimal, Decimal)]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thresholds WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&mut *tx)
            .await?;
        if count.0 > 0 {
            return Ok(false);
        }

        for (price, amount) in rows {
            sqlx::query("INSERT INTO thresholds (symbol, price, release_amount, released) VALUES (?, ?, ?, 0)")
                .bind(symbol)
                .bind(price.to_string())
                .bind(amount.to_string())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO ladder (symbol, sold) VALUES (?, '0') ON CONFLICT(symbol) DO UPDATE SET sold = '0'")
            .bind(symbol)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("[DB] Seeded {} thresholds for {}", rows.len(), symbol);
        Ok(true)
    }

    pub async fn load_thresholds(&self, symbol: &str) -> Result<Vec<ExitThreshold>> {
        let rows = sqlx::query(
            "SELECT id, price, release_amount, released, linked_order_id FROM thresholds WHERE symbol = ? ORDER BY id",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_threshold).collect()
    }

    // ==================== DEPOSIT ROUNDS ====================

    /// Latest deposit round for the symbol, completed or not
    pub async fn latest_deposit_round(&self, symbol: &str) -> Result<Option<DepositRange>> {
        let row = sqlx::query(
            r#"
            SELECT deposit_price, upper_bound, lower_bound, stop_armed, completed
            FROM deposit_rounds WHERE symbol = ? ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_range).transpose()
    }

    /// Open a new round: fresh range, unset stop, pair no longer completed
    pub async fn start_deposit_round(&self, key: &PairKey, range: &DepositRange) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO deposit_rounds (symbol, deposit_price, upper_bound, lower_bound, stop_armed, completed, created_at)
            VALUES (?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(&key.symbol)
        .bind(range.deposit_price.to_string())
        .bind(range.upper_bound.to_string())
        .bind(range.lower_bound.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        write_stop(&mut *tx, key, &StopState::unset(key.mode)).await?;

        sqlx::query(
            r#"
            INSERT INTO run_stats (symbol, mode, deposit_price) VALUES (?, ?, ?)
            ON CONFLICT(symbol, mode) DO UPDATE SET deposit_price = excluded.deposit_price
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(range.deposit_price.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO pair_status (symbol, mode, completed, updated_at) VALUES (?, ?, 0, ?)
            ON CONFLICT(symbol, mode) DO UPDATE SET completed = 0, updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "[DB] {} deposit round started at {} (band {} - {})",
            key, range.deposit_price, range.lower_bound, range.upper_bound
        );
        Ok(())
    }

    // ==================== SELL RUNS ====================

    /// Claim the sell pair for a run with this ladder setup. A finished run, or
    /// one made with the other setup, is replaced by a fresh one: unset stop, no
    /// thresholds (the caller seeds new ones), not completed. An unsettled
    /// pending order keeps the old run alive until the gate resolves it.
    /// Returns whether the previous run was replaced.
    pub async fn begin_sell_run(&self, key: &PairKey, simple: bool) -> Result<bool> {
        let setup = if simple { "simple" } else { "ladder" };
        let mut tx = self.pool.begin().await?;

        let status: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT completed, setup FROM pair_status WHERE symbol = ? AND mode = ?")
                .bind(&key.symbol)
                .bind(key.mode.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let pending: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_orders WHERE symbol = ? AND mode = ?")
            .bind(&key.symbol)
            .bind(key.mode.as_str())
            .fetch_one(&mut *tx)
            .await?;

        let stale = match &status {
            Some((completed, previous)) => *completed != 0 || previous.as_deref().is_some_and(|p| p != setup),
            None => false,
        };
        let replace = stale && pending.0 == 0;
        let now = Utc::now().to_rfc3339();

        if replace {
            sqlx::query("DELETE FROM thresholds WHERE symbol = ?")
                .bind(&key.symbol)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM ladder WHERE symbol = ?")
                .bind(&key.symbol)
                .execute(&mut *tx)
                .await?;
            write_stop(&mut *tx, key, &StopState::unset(key.mode)).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO pair_status (symbol, mode, completed, setup, updated_at) VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(symbol, mode) DO UPDATE SET
                completed = CASE WHEN ? THEN 0 ELSE pair_status.completed END,
                setup = excluded.setup,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(setup)
        .bind(&now)
        .bind(replace)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if replace {
            info!("[DB] {} previous sell run replaced by a fresh {} run", key, setup);
        }
        Ok(replace)
    }

    // ==================== PAIR STATE ====================

    /// Rebuild a pair's working state exactly as of its last committed tick.
    /// `simple` selects a ladder-less sell pair.
    pub async fn load_pair_state(&self, key: &PairKey, simple: bool) -> Result<PairState> {
        let mode = match key.mode {
            TradeMode::Sell if simple => ModeState::Sell { ladder: None },
            TradeMode::Sell => {
                let thresholds = self.load_thresholds(&key.symbol).await?;
                if thresholds.is_empty() {
                    return Err(PersistenceError::Missing(format!("thresholds for {}", key.symbol)));
                }
                let sold: Option<(String,)> = sqlx::query_as("SELECT sold FROM ladder WHERE symbol = ?")
                    .bind(&key.symbol)
                    .fetch_optional(&self.pool)
                    .await?;
                let sold = match sold {
                    Some((s,)) => parse_decimal("ladder.sold", &s)?,
                    None => Decimal::ZERO,
                };
                let ladder = ExitLadder::new(thresholds, sold).map_err(|e| PersistenceError::Corrupt {
                    column: "thresholds",
                    value: e.to_string(),
                })?;
                ModeState::Sell { ladder: Some(ladder) }
            }
            TradeMode::Buy => {
                let range = self
                    .latest_deposit_round(&key.symbol)
                    .await?
                    .ok_or_else(|| PersistenceError::Missing(format!("deposit round for {}", key.symbol)))?;
                ModeState::Buy { range }
            }
        };

        let stop = self.load_stop(key).await?;
        let stats = self.load_stats(key).await?;
        let pending = self.load_pending(key).await?;

        let status: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT completed, halted_reason FROM pair_status WHERE symbol = ? AND mode = ?")
                .bind(&key.symbol)
                .bind(key.mode.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let (completed, halted) = status.map(|(c, h)| (c != 0, h)).unwrap_or((false, None));

        Ok(PairState {
            key: key.clone(),
            stop,
            mode,
            stats,
            pending,
            completed,
            halted,
        })
    }

    /// Write-through of one tick's state, staged order included
    pub async fn commit_tick(&self, state: &PairState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_pair_state(&mut *tx, state).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a confirmed fill: post-fill state plus the trade record
    pub async fn record_fill(&self, state: &PairState, order: &PendingOrder, ack: &OrderAck) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_pair_state(&mut *tx, state).await?;

        sqlx::query(
            r#"
            INSERT INTO trades (symbol, mode, order_id, client_order_id, side, size_unit, size, price, reason, filled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_order_id) DO NOTHING
            "#,
        )
        .bind(&state.key.symbol)
        .bind(state.key.mode.as_str())
        .bind(&ack.order_id)
        .bind(&order.client_order_id)
        .bind(order.side.as_str())
        .bind(order.size.unit())
        .bind(order.size.amount().to_string())
        .bind(ack.average_price.unwrap_or(order.trigger_price).to_string())
        .bind(order.reason.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn halt_pair(&self, key: &PairKey, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pair_status (symbol, mode, completed, halted_reason, updated_at) VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(symbol, mode) DO UPDATE SET halted_reason = excluded.halted_reason, updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        warn!("[DB] {} halted: {}", key, reason);
        Ok(())
    }

    /// Manual intervention: un-halt and give a pending order a fresh retry budget.
    /// Returns whether the pair was halted.
    pub async fn clear_halt(&self, key: &PairKey) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE pair_status SET halted_reason = NULL, updated_at = ? WHERE symbol = ? AND mode = ? AND halted_reason IS NOT NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE pending_orders SET attempts = 0, next_attempt_at = NULL WHERE symbol = ? AND mode = ?")
            .bind(&key.symbol)
            .bind(key.mode.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recent_trades(&self, key: &PairKey, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, side, size_unit, size, price, filled_at FROM trades
            WHERE symbol = ? AND mode = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let side: String = row.try_get("side")?;
                let unit: String = row.try_get("size_unit")?;
                let size = parse_decimal("trades.size", &row.try_get::<String, _>("size")?)?;
                Ok(TradeRecord {
                    order_id: row.try_get("order_id")?,
                    side: OrderSide::from_str(&side).map_err(|_| corrupt("trades.side", &side))?,
                    size: OrderSize::from_parts(&unit, size).ok_or_else(|| corrupt("trades.size_unit", &unit))?,
                    price: parse_decimal("trades.price", &row.try_get::<String, _>("price")?)?,
                    filled_at: parse_time("trades.filled_at", &row.try_get::<String, _>("filled_at")?)?,
                })
            })
            .collect()
    }

    async fn load_stop(&self, key: &PairKey) -> Result<StopState> {
        let row: Option<(Option<String>, i64, Option<String>)> = sqlx::query_as(
            "SELECT current_stop, armed, anchor_price FROM stop_state WHERE symbol = ? AND mode = ?",
        )
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(StopState::unset(key.mode)),
            Some((current_stop, armed, anchor_price)) => Ok(StopState {
                direction: key.mode,
                current_stop: parse_opt_decimal("stop_state.current_stop", current_stop)?,
                armed: armed != 0,
                anchor_price: parse_opt_decimal("stop_state.anchor_price", anchor_price)?,
            }),
        }
    }

    async fn load_stats(&self, key: &PairKey) -> Result<RunStatistics> {
        let row = sqlx::query("SELECT * FROM run_stats WHERE symbol = ? AND mode = ?")
            .bind(&key.symbol)
            .bind(key.mode.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(RunStatistics::default());
        };

        Ok(RunStatistics {
            trades_executed: row.try_get("trades_executed")?,
            base_volume: parse_decimal("run_stats.base_volume", &row.try_get::<String, _>("base_volume")?)?,
            quote_volume: parse_decimal("run_stats.quote_volume", &row.try_get::<String, _>("quote_volume")?)?,
            last_entry_price: parse_opt_decimal("run_stats.last_entry_price", row.try_get("last_entry_price")?)?,
            last_exit_price: parse_opt_decimal("run_stats.last_exit_price", row.try_get("last_exit_price")?)?,
            deposit_price: parse_opt_decimal("run_stats.deposit_price", row.try_get("deposit_price")?)?,
            buy_count: row.try_get("buy_count")?,
            win_count: row.try_get("win_count")?,
        })
    }

    async fn load_pending(&self, key: &PairKey) -> Result<Option<PendingOrder>> {
        let row = sqlx::query("SELECT * FROM pending_orders WHERE symbol = ? AND mode = ?")
            .bind(&key.symbol)
            .bind(key.mode.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_pending).transpose()
    }
}

async fn write_pair_state(conn: &mut SqliteConnection, state: &PairState) -> Result<()> {
    let key = &state.key;
    let now = Utc::now().to_rfc3339();

    write_stop(conn, key, &state.stop).await?;

    match &state.mode {
        ModeState::Sell { ladder: Some(ladder) } => {
            for t in ladder.thresholds() {
                sqlx::query("UPDATE thresholds SET released = ?, linked_order_id = ? WHERE id = ?")
                    .bind(t.released)
                    .bind(t.linked_order_id.as_deref())
                    .bind(t.id)
                    .execute(&mut *conn)
                    .await?;
            }
            sqlx::query(
                "INSERT INTO ladder (symbol, sold) VALUES (?, ?) ON CONFLICT(symbol) DO UPDATE SET sold = excluded.sold",
            )
            .bind(&key.symbol)
            .bind(ladder.sold().to_string())
            .execute(&mut *conn)
            .await?;
        }
        ModeState::Sell { ladder: None } => {}
        ModeState::Buy { range } => {
            sqlx::query(
                r#"
                UPDATE deposit_rounds SET stop_armed = ?, completed = ?
                WHERE id = (SELECT MAX(id) FROM deposit_rounds WHERE symbol = ?)
                "#,
            )
            .bind(range.stop_armed)
            .bind(range.completed)
            .bind(&key.symbol)
            .execute(&mut *conn)
            .await?;
        }
    }

    let stats = &state.stats;
    sqlx::query(
        r#"
        INSERT INTO run_stats (symbol, mode, trades_executed, base_volume, quote_volume, last_entry_price,
                               last_exit_price, deposit_price, buy_count, win_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(symbol, mode) DO UPDATE SET
            trades_executed = excluded.trades_executed,
            base_volume = excluded.base_volume,
            quote_volume = excluded.quote_volume,
            last_entry_price = excluded.last_entry_price,
            last_exit_price = excluded.last_exit_price,
            deposit_price = excluded.deposit_price,
            buy_count = excluded.buy_count,
            win_count = excluded.win_count
        "#,
    )
    .bind(&key.symbol)
    .bind(key.mode.as_str())
    .bind(stats.trades_executed)
    .bind(stats.base_volume.to_string())
    .bind(stats.quote_volume.to_string())
    .bind(stats.last_entry_price.map(|d| d.to_string()))
    .bind(stats.last_exit_price.map(|d| d.to_string()))
    .bind(stats.deposit_price.map(|d| d.to_string()))
    .bind(stats.buy_count)
    .bind(stats.win_count)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM pending_orders WHERE symbol = ? AND mode = ?")
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .execute(&mut *conn)
        .await?;

    if let Some(order) = &state.pending {
        sqlx::query(
            r#"
            INSERT INTO pending_orders (client_order_id, symbol, mode, side, size_unit, size, trigger_price,
                                        reason, attempts, last_error, next_attempt_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.client_order_id)
        .bind(&key.symbol)
        .bind(key.mode.as_str())
        .bind(order.side.as_str())
        .bind(order.size.unit())
        .bind(order.size.amount().to_string())
        .bind(order.trigger_price.to_string())
        .bind(order.reason.as_str())
        .bind(order.attempts as i64)
        .bind(order.last_error.as_deref())
        .bind(order.next_attempt_at.map(|t| t.to_rfc3339()))
        .bind(order.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO pair_status (symbol, mode, completed, halted_reason, updated_at) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(symbol, mode) DO UPDATE SET
            completed = excluded.completed,
            halted_reason = excluded.halted_reason,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&key.symbol)
    .bind(key.mode.as_str())
    .bind(state.completed)
    .bind(state.halted.as_deref())
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_stop(conn: &mut SqliteConnection, key: &PairKey, stop: &StopState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stop_state (symbol, mode, current_stop, armed, anchor_price, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(symbol, mode) DO UPDATE SET
            current_stop = excluded.current_stop,
            armed = excluded.armed,
            anchor_price = excluded.anchor_price,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&key.symbol)
    .bind(key.mode.as_str())
    .bind(stop.current_stop.map(|d| d.to_string()))
    .bind(stop.armed)
    .bind(stop.anchor_price.map(|d| d.to_string()))
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_threshold(row: &SqliteRow) -> Result<ExitThreshold> {
    Ok(ExitThreshold {
        id: row.try_get("id")?,
        price: parse_decimal("thresholds.price", &row.try_get::<String, _>("price")?)?,
        release_amount: parse_decimal("thresholds.release_amount", &row.try_get::<String, _>("release_amount")?)?,
        released: row.try_get::<i64, _>("released")? != 0,
        linked_order_id: row.try_get("linked_order_id")?,
    })
}

fn row_to_range(row: &SqliteRow) -> Result<DepositRange> {
    Ok(DepositRange {
        deposit_price: parse_decimal("deposit_rounds.deposit_price", &row.try_get::<String, _>("deposit_price")?)?,
        upper_bound: parse_decimal("deposit_rounds.upper_bound", &row.try_get::<String, _>("upper_bound")?)?,
        lower_bound: parse_decimal("deposit_rounds.lower_bound", &row.try_get::<String, _>("lower_bound")?)?,
        stop_armed: row.try_get::<i64, _>("stop_armed")? != 0,
        completed: row.try_get::<i64, _>("completed")? != 0,
    })
}

fn row_to_pending(row: &SqliteRow) -> Result<PendingOrder> {
    let side: String = row.try_get("side")?;
    let unit: String = row.try_get("size_unit")?;
    let reason: String = row.try_get("reason")?;
    let size = parse_decimal("pending_orders.size", &row.try_get::<String, _>("size")?)?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(PendingOrder {
        client_order_id: row.try_get("client_order_id")?,
        side: OrderSide::from_str(&side).map_err(|_| corrupt("pending_orders.side", &side))?,
        size: OrderSize::from_parts(&unit, size).ok_or_else(|| corrupt("pending_orders.size_unit", &unit))?,
        trigger_price: parse_decimal("pending_orders.trigger_price", &row.try_get::<String, _>("trigger_price")?)?,
        reason: TradeReason::from_str(&reason).map_err(|_| corrupt("pending_orders.reason", &reason))?,
        attempts: u32::try_from(attempts).map_err(|_| corrupt("pending_orders.attempts", &attempts.to_string()))?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: parse_opt_time("pending_orders.next_attempt_at", row.try_get("next_attempt_at")?)?,
        created_at: parse_time("pending_orders.created_at", &row.try_get::<String, _>("created_at")?)?,
    })
}

fn corrupt(column: &'static str, value: &str) -> PersistenceError {
    PersistenceError::Corrupt {
        column,
        value: value.to_string(),
    }
}

fn parse_decimal(column: &'static str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|_| corrupt(column, value))
}

fn parse_opt_decimal(column: &'static str, value: Option<String>) -> Result<Option<Decimal>> {
    value.map(|v| parse_decimal(column, &v)).transpose()
}

fn parse_time(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| corrupt(column, value))
}

fn parse_opt_time(column: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(column, &v)).transpose()
}
