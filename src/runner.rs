//! Poll loop
//!
//! One cooperative loop advances every pair once per interval, in order.
//! Buy pairs share their quote balance: it is fetched and split once per tick
//! before any pair evaluates. Cancellation is checked between ticks only.

use crate::config::{Config, LadderSetup, RunConfig};
use crate::db::Database;
use crate::error::{EngineError, ExecutionError};
use crate::executor::ExecutionGate;
use crate::services::exchange::Exchange;
use crate::services::metrics::Metrics;
use crate::services::retry::{with_retry, RetryConfig};
use crate::strategies::engine::{PairState, StrategyEngine, TickContext};
use crate::strategies::exit_ladder::{default_ladder, resolve_entries};
use crate::types::{DepositRange, PairKey, TradeMode};
use crate::webhook::DiscordWebhook;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub struct PollLoop {
    run: RunConfig,
    exchange: Arc<dyn Exchange>,
    db: Arc<Database>,
    gate: ExecutionGate,
    feed_retry: RetryConfig,
    fee_buffer: Decimal,
    metrics: Metrics,
    webhook: Option<DiscordWebhook>,
    engines: Vec<StrategyEngine>,
    locked: Vec<PairKey>,
}

impl PollLoop {
    pub fn new(run: RunConfig, config: &Config, exchange: Arc<dyn Exchange>, db: Arc<Database>, metrics: Metrics) -> Self {
        let webhook = config.discord_webhook_url.clone().map(DiscordWebhook::new);
        let gate = ExecutionGate::new(exchange.clone(), db.clone(), config.order_retry.clone(), metrics.clone())
            .with_webhook(webhook.clone());

        Self {
            run,
            exchange,
            db,
            gate,
            feed_retry: config.feed_retry.clone(),
            fee_buffer: config.buy_fee_buffer,
            metrics,
            webhook,
            engines: Vec::new(),
            locked: Vec::new(),
        }
    }

    pub fn states(&self) -> impl Iterator<Item = &PairState> {
        self.engines.iter().map(|e| e.state())
    }

    /// Take the instance locks, seed what is missing and load every pair
    pub async fn bootstrap(&mut self) -> Result<()> {
        let pid = std::process::id() as i64;
        for key in self.run.pairs.clone() {
            if let Err(e) = self.db.acquire_lock(&key, pid).await {
                self.release_locks().await;
                return Err(e).context(format!("{} is already running (use reset-lock if it crashed)", key));
            }
            self.locked.push(key);
        }

        for key in self.run.pairs.clone() {
            match key.mode {
                TradeMode::Sell => self.prepare_sell(&key).await?,
                TradeMode::Buy => self.prepare_buy(&key).await?,
            }

            let state = self
                .db
                .load_pair_state(&key, self.run.is_simple())
                .await
                .with_context(|| format!("loading state for {}", key))?;

            if let Some(reason) = &state.halted {
                warn!("[Loop] {} is halted ({}); run `resume` to continue it", key, reason);
            } else if state.completed {
                info!("[Loop] {} already completed", key);
            } else {
                info!(
                    "[Loop] {} loaded: stop {:?}, pending order {}",
                    key,
                    state.stop.current_stop,
                    state.pending.as_ref().map(|p| p.client_order_id.as_str()).unwrap_or("none")
                );
            }

            self.engines.push(StrategyEngine::new(self.run.policy, self.fee_buffer, state));
        }

        Ok(())
    }

    /// Replace a finished run, then seed the threshold ladder unless one is stored
    async fn prepare_sell(&self, key: &PairKey) -> Result<()> {
        if self.db.begin_sell_run(key, self.run.is_simple()).await? {
            info!("[Loop] {} starting a fresh run over the previous one", key);
        }

        let entries = match &self.run.ladder {
            LadderSetup::Simple => return Ok(()),
            _ if self.db.has_thresholds(&key.symbol).await? => {
                info!("[Loop] {} reusing stored threshold ladder", key);
                return Ok(());
            }
            LadderSetup::Custom(entries) => entries.clone(),
            LadderSetup::Default => {
                let balance =
                    with_retry(&self.feed_retry, "balance", || self.exchange.available_balance(key.base())).await?;
                if balance <= Decimal::ZERO {
                    bail!("{} has no {} balance to build a ladder from", key, key.base());
                }
                default_ladder(balance)
            }
        };

        let price = with_retry(&self.feed_retry, "price", || self.exchange.current_price(&key.symbol)).await?;
        let rows = resolve_entries(&entries, price);
        for (level, amount) in &rows {
            info!("[Loop] {} threshold {} releases {}", key, level, amount);
        }
        self.db.seed_thresholds(&key.symbol, &rows).await?;
        Ok(())
    }

    /// Open a deposit round unless one is in progress
    async fn prepare_buy(&self, key: &PairKey) -> Result<()> {
        if let Some(range) = self.db.latest_deposit_round(&key.symbol).await? {
            if !range.completed {
                if self.run.deposit_price.is_some_and(|p| p != range.deposit_price) {
                    warn!(
                        "[Loop] {} round in progress at deposit {}, ignoring --deposit-price",
                        key, range.deposit_price
                    );
                }
                return Ok(());
            }
        }

        let deposit = match self.run.deposit_price {
            Some(price) => price,
            None => with_retry(&self.feed_retry, "price", || self.exchange.current_price(&key.symbol)).await?,
        };
        self.db
            .start_deposit_round(key, &DepositRange::new(deposit, &self.run.policy))
            .await?;
        Ok(())
    }

    /// Quote balance share per quote currency, for active buy pairs
    async fn buy_shares(&self) -> HashMap<String, Decimal> {
        let mut shares = HashMap::new();
        let split = Decimal::from(self.run.split);

        for engine in self.engines.iter().filter(|e| e.is_active() && e.key().mode == TradeMode::Buy) {
            let quote = engine.key().quote().to_string();
            if shares.contains_key(&quote) {
                continue;
            }
            match with_retry(&self.feed_retry, "balance", || self.exchange.available_balance(&quote)).await {
                Ok(balance) => {
                    shares.insert(quote, balance / split);
                }
                Err(e) => warn!("[Loop] {} balance unavailable: {}", quote, e),
            }
        }

        shares
    }

    /// Advance every active pair by one tick
    pub async fn tick_all(&mut self) {
        let shares = self.buy_shares().await;

        let ctx = TickContext {
            exchange: self.exchange.as_ref(),
            db: &self.db,
            gate: &self.gate,
            feed_retry: &self.feed_retry,
        };

        for engine in self.engines.iter_mut() {
            if !engine.is_active() {
                continue;
            }
            let key = engine.key().clone();

            let share = match key.mode {
                TradeMode::Buy => match shares.get(key.quote()) {
                    Some(share) => Some(*share),
                    None => {
                        self.metrics.inc_ticks_skipped();
                        continue;
                    }
                },
                TradeMode::Sell => None,
            };

            self.metrics.inc_ticks();
            match engine.tick(&ctx, share).await {
                Ok(report) => {
                    self.metrics.add_thresholds_released(report.released as u64);
                    if let Some(err) = report.order_error {
                        warn!("[Loop] {} order will be retried: {}", key, err);
                    }
                }
                Err(EngineError::Feed(e)) => {
                    warn!("[Loop] {} tick skipped: {}", key, e);
                    self.metrics.inc_ticks_skipped();
                }
                Err(EngineError::Execution(ExecutionError::Halted { reason })) => {
                    error!("[Loop] {} halted: {}", key, reason);
                }
                Err(e) => {
                    // State can no longer be verified: stop this pair only
                    let reason = format!("state error: {}", e);
                    error!("[Loop] {} HALTED: {}", key, reason);
                    engine.halt_in_memory(reason.clone());
                    if let Err(db_err) = self.db.halt_pair(&key, &reason).await {
                        error!("[Loop] {} could not persist halt: {}", key, db_err);
                    }
                    self.metrics.inc_pairs_halted();
                    if let Some(webhook) = &self.webhook {
                        webhook.send_halt_alert(&key, &reason).await;
                    }
                }
            }
        }
    }

    pub fn has_active_pairs(&self) -> bool {
        self.engines.iter().any(|e| e.is_active())
    }

    /// Tick until shutdown is signalled or no pair is left to trade
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "[Loop] Running {} pair(s) in {} mode, stop {}, every {:?} via {}",
            self.engines.len(),
            self.run.mode,
            self.run.policy,
            self.run.interval,
            self.exchange.name()
        );

        loop {
            if *shutdown.borrow() {
                info!("[Loop] Shutdown requested");
                break;
            }

            self.tick_all().await;

            if !self.has_active_pairs() {
                info!("[Loop] No active pairs left");
                break;
            }

            tokio::select! {
                _ = sleep(self.run.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Release locks and report counters
    pub async fn shutdown(&mut self) {
        self.release_locks().await;
        let snap = self.metrics.snapshot();
        info!(
            "[Loop] Stopped. ticks={} skipped={} released={} submitted={} filled={} failed={} reconciled={} halted={}",
            snap.ticks,
            snap.ticks_skipped,
            snap.thresholds_released,
            snap.orders_submitted,
            snap.orders_filled,
            snap.orders_failed,
            snap.orders_reconciled,
            snap.pairs_halted
        );
        for state in self.states() {
            info!(
                "[Loop] {} trades={} base={} quote={}{}",
                state.key,
                state.stats.trades_executed,
                state.stats.base_volume,
                state.stats.quote_volume,
                if state.completed { " (completed)" } else { "" }
            );
        }
    }

    async fn release_locks(&mut self) {
        for key in self.locked.drain(..) {
            if let Err(e) = self.db.release_lock(&key).await {
                warn!("[Loop] Failed to release lock for {}: {}", key, e);
            }
        }
    }
}
