//! Execution gate: at-most-once order execution per crossing
//!
//! An intent is staged as a `PendingOrder` with a fresh client order id and
//! committed together with the state that produced it before anything is
//! sent. Submission reuses that id, so a resubmission after a lost response
//! cannot create a second order. A pending order carried over from an
//! earlier tick (or an earlier process) is first looked up on the exchange
//! and only resubmitted if it never landed.
//!
//! Failures leave the triggering transition in place and schedule a retry on
//! a later tick with exponential backoff. A terminal rejection, or running
//! out of retries, halts the pair until `resume`.

use crate::db::Database;
use crate::error::{ExecutionError, OrderError, PersistenceError};
use crate::services::exchange::{Exchange, OrderAck, OrderRequest};
use crate::services::metrics::Metrics;
use crate::services::retry::RetryConfig;
use crate::strategies::engine::PairState;
use crate::types::{PendingOrder, TradeIntent};
use crate::webhook::DiscordWebhook;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ExecutionGate {
    exchange: Arc<dyn Exchange>,
    db: Arc<Database>,
    /// Cross-tick retry budget and backoff for order submission
    policy: RetryConfig,
    metrics: Metrics,
    webhook: Option<DiscordWebhook>,
}

impl ExecutionGate {
    pub fn new(exchange: Arc<dyn Exchange>, db: Arc<Database>, policy: RetryConfig, metrics: Metrics) -> Self {
        Self {
            exchange,
            db,
            policy,
            metrics,
            webhook: None,
        }
    }

    pub fn with_webhook(mut self, webhook: Option<DiscordWebhook>) -> Self {
        self.webhook = webhook;
        self
    }

    /// Attach a staged order to the state. The caller commits it.
    pub fn stage(&self, state: &mut PairState, intent: &TradeIntent) {
        let order = PendingOrder::from_intent(intent);
        info!(
            "[Gate] {} staged {} {} at trigger {} ({}, client id {})",
            state.key,
            order.side,
            order.size,
            order.trigger_price,
            order.reason.as_str(),
            order.client_order_id
        );
        state.pending = Some(order);
    }

    /// Submit the order staged on this tick. Returns the exchange order id.
    pub async fn execute(&self, state: &mut PairState) -> Result<String, ExecutionError> {
        let order = state
            .pending
            .clone()
            .ok_or_else(|| PersistenceError::Missing(format!("staged order for {}", state.key)))?;
        self.submit(state, order).await
    }

    /// Settle an order left pending by an earlier tick or process.
    /// `Ok(None)` means nothing was due this tick.
    pub async fn resume(&self, state: &mut PairState) -> Result<Option<String>, ExecutionError> {
        let Some(order) = state.pending.clone() else {
            return Ok(None);
        };

        match self.exchange.find_order(&state.key.symbol, &order.client_order_id).await {
            Ok(Some(ack)) => {
                info!(
                    "[Gate] {} order {} already on the exchange as {}",
                    state.key, order.client_order_id, ack.order_id
                );
                self.metrics.inc_orders_reconciled();
                return self.settle(state, &order, ack).await.map(Some);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[Gate] {} lookup of {} failed: {}", state.key, order.client_order_id, e);
                return Err(self.record_failure(state, order, e).await);
            }
        }

        if !order.is_due(Utc::now()) {
            debug!(
                "[Gate] {} order {} backing off until {:?}",
                state.key, order.client_order_id, order.next_attempt_at
            );
            return Ok(None);
        }

        self.submit(state, order).await.map(Some)
    }

    async fn submit(&self, state: &mut PairState, order: PendingOrder) -> Result<String, ExecutionError> {
        let request = OrderRequest {
            symbol: state.key.symbol.clone(),
            side: order.side,
            size: order.size,
            client_order_id: order.client_order_id.clone(),
        };

        self.metrics.inc_orders_submitted();
        info!(
            "[Gate] {} submitting {} {} via {} (attempt {}, client id {})",
            state.key,
            order.side,
            order.size,
            self.exchange.name(),
            order.attempts + 1,
            order.client_order_id
        );

        match self.exchange.place_market_order(&request).await {
            Ok(ack) => self.settle(state, &order, ack).await,
            Err(e) => Err(self.record_failure(state, order, e).await),
        }
    }

    /// Apply and persist a confirmed fill, then swap it into memory
    async fn settle(&self, state: &mut PairState, order: &PendingOrder, ack: OrderAck) -> Result<String, ExecutionError> {
        let mut next = state.clone();
        next.apply_fill(order, &ack);
        self.db.record_fill(&next, order, &ack).await?;
        *state = next;

        self.metrics.inc_orders_filled();
        let price = ack.average_price.unwrap_or(order.trigger_price);
        info!(
            "[Gate] {} filled {} {} at {} (order {})",
            state.key, order.side, order.size, price, ack.order_id
        );
        if state.completed {
            info!("[Gate] {} run completed", state.key);
        }

        if let Some(webhook) = &self.webhook {
            webhook.send_fill_alert(&state.key, order, &ack.order_id, price).await;
        }

        Ok(ack.order_id)
    }

    /// Count the failed attempt and either schedule a retry or halt the pair
    async fn record_failure(&self, state: &mut PairState, mut order: PendingOrder, err: OrderError) -> ExecutionError {
        self.metrics.inc_orders_failed();
        order.attempts += 1;
        order.last_error = Some(err.to_string());

        let halt_reason = if !err.is_retryable() {
            Some(format!("order {} not retryable: {}", order.client_order_id, err))
        } else if order.attempts > self.policy.max_retries {
            Some(format!(
                "order {} failed {} times, last error: {}",
                order.client_order_id, order.attempts, err
            ))
        } else {
            None
        };

        if halt_reason.is_none() {
            let delay = self.policy.delay_for_attempt(order.attempts);
            order.next_attempt_at = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            warn!(
                "[Gate] {} order attempt {}/{} failed ({}), next try after {}ms",
                state.key,
                order.attempts,
                self.policy.max_retries + 1,
                err,
                delay.as_millis()
            );
        }

        state.pending = Some(order);
        state.halted = halt_reason.clone();

        if let Err(e) = self.db.commit_tick(state).await {
            error!("[Gate] {} could not record order failure: {}", state.key, e);
            return ExecutionError::Persistence(e);
        }

        match halt_reason {
            Some(reason) => {
                error!("[Gate] {} HALTED: {}", state.key, reason);
                self.metrics.inc_pairs_halted();
                if let Some(webhook) = &self.webhook {
                    webhook.send_halt_alert(&state.key, &reason).await;
                }
                ExecutionError::Halted { reason }
            }
            None => ExecutionError::Order(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrderErrorReason;
    use crate::services::mock::{InjectedFailure, MockExchange};
    use crate::types::{OrderSide, OrderSize, PairKey, TradeMode, TradeReason};
    use rust_decimal_macros::dec;

    fn policy(max_retries: u32, initial_delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
        }
    }

    fn sell_intent() -> TradeIntent {
        TradeIntent {
            side: OrderSide::Sell,
            size: OrderSize::Base(dec!(0.5)),
            trigger_price: dec!(100),
            reason: TradeReason::StopCrossing,
        }
    }

    async fn setup(mock: &MockExchange, policy: RetryConfig) -> (ExecutionGate, Arc<Database>, PairState) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let key = PairKey::new("BTC/USD", TradeMode::Sell).unwrap();
        let mut state = db.load_pair_state(&key, true).await.unwrap();
        let gate = ExecutionGate::new(Arc::new(mock.clone()), db.clone(), policy, Metrics::new());

        gate.stage(&mut state, &sell_intent());
        db.commit_tick(&state).await.unwrap();
        (gate, db, state)
    }

    fn mock() -> MockExchange {
        MockExchange::new()
            .with_prices("BTC/USD", &[dec!(100)])
            .with_balance("BTC", dec!(1))
    }

    #[tokio::test]
    async fn test_execute_fills_and_clears_pending() {
        let mock = mock();
        let (gate, db, mut state) = setup(&mock, policy(3, 0)).await;

        let order_id = gate.execute(&mut state).await.unwrap();
        assert_eq!(order_id, "mock-1");
        assert!(state.pending.is_none());
        assert!(state.completed);
        assert_eq!(state.stats.trades_executed, 1);

        let stored = db.load_pair_state(&state.key, true).await.unwrap();
        assert!(stored.pending.is_none());
        assert!(stored.completed);
        assert_eq!(mock.order_count(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let mock = mock();
        let (gate, db, mut state) = setup(&mock, policy(3, 60_000)).await;
        mock.fail_next_order(InjectedFailure::Reject(OrderError::network("connection reset")));

        let err = gate.execute(&mut state).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Order(_)));

        let pending = state.pending.clone().unwrap();
        assert_eq!(pending.attempts, 1);
        assert!(pending.next_attempt_at.is_some());
        assert!(state.halted.is_none());
        assert_eq!(db.load_pair_state(&state.key, true).await.unwrap().pending.unwrap().attempts, 1);

        // Not due yet: nothing is resubmitted
        assert_eq!(gate.resume(&mut state).await.unwrap(), None);
        assert_eq!(mock.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_reuses_client_order_id() {
        let mock = mock();
        let (gate, _db, mut state) = setup(&mock, policy(3, 0)).await;
        mock.fail_next_order(InjectedFailure::Reject(OrderError::new(OrderErrorReason::RateLimited)));

        assert!(gate.execute(&mut state).await.is_err());
        let order_id = gate.resume(&mut state).await.unwrap();
        assert_eq!(order_id.as_deref(), Some("mock-1"));

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].client_order_id, submissions[1].client_order_id);
        assert_eq!(mock.order_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_is_reconciled_not_resubmitted() {
        let mock = mock();
        let (gate, _db, mut state) = setup(&mock, policy(3, 0)).await;
        mock.fail_next_order(InjectedFailure::AcceptThenFail(OrderError::network("timed out")));

        assert!(gate.execute(&mut state).await.is_err());
        assert_eq!(mock.order_count(), 1);

        let order_id = gate.resume(&mut state).await.unwrap();
        assert_eq!(order_id.as_deref(), Some("mock-1"));
        assert_eq!(mock.submissions().len(), 1);
        assert!(state.pending.is_none());
        assert_eq!(state.stats.trades_executed, 1);
    }

    #[tokio::test]
    async fn test_terminal_rejection_halts() {
        let mock = mock();
        let (gate, db, mut state) = setup(&mock, policy(3, 0)).await;
        mock.fail_next_order(InjectedFailure::Reject(OrderError::new(OrderErrorReason::InsufficientFunds)));

        let err = gate.execute(&mut state).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Halted { .. }));
        assert!(state.halted.is_some());

        let stored = db.load_pair_state(&state.key, true).await.unwrap();
        assert!(stored.halted.is_some());
        // The staged order survives for inspection and resume
        assert!(stored.pending.is_some());
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_halts() {
        let mock = mock();
        let (gate, _db, mut state) = setup(&mock, policy(1, 0)).await;
        mock.fail_next_order(InjectedFailure::Reject(OrderError::network("reset")));
        mock.fail_next_order(InjectedFailure::Reject(OrderError::network("reset")));

        assert!(matches!(gate.execute(&mut state).await, Err(ExecutionError::Order(_))));
        assert!(matches!(gate.resume(&mut state).await, Err(ExecutionError::Halted { .. })));
        assert_eq!(state.pending.as_ref().unwrap().attempts, 2);
        assert_eq!(mock.order_count(), 0);
    }
}
