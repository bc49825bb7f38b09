//! Strategy engine - one per tracked pair
//!
//! Composes the trailing stop with the exit ladder (sell) or the deposit
//! range monitor (buy). `evaluate` is a pure function of the persisted pair
//! state and the tick; `tick` wraps it with the feed calls, write-through
//! persistence and the execution gate.

use super::deposit_range::{DepositRangeMonitor, RangeAction};
use super::exit_ladder::ExitLadder;
use super::trailing_stop::TrailingStopTracker;
use crate::db::Database;
use crate::error::{EngineError, ExecutionError};
use crate::executor::ExecutionGate;
use crate::services::exchange::{Exchange, OrderAck};
use crate::services::retry::{with_retry, RetryConfig};
use crate::types::{
    DepositRange, OrderSide, OrderSize, PairKey, PendingOrder, RunStatistics, StopDistancePolicy,
    StopState, TradeIntent, TradeMode, TradeReason,
};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Mode-specific part of a pair's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeState {
    /// `None` ladder means simple mode: a crossing sells the whole holding
    Sell { ladder: Option<ExitLadder> },
    Buy { range: DepositRange },
}

/// Everything needed to resume a pair after a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairState {
    pub key: PairKey,
    pub stop: StopState,
    pub mode: ModeState,
    pub stats: RunStatistics,
    /// Staged order awaiting confirmation
    pub pending: Option<PendingOrder>,
    pub completed: bool,
    pub halted: Option<String>,
}

impl PairState {
    pub fn new_sell(key: PairKey, ladder: Option<ExitLadder>) -> Self {
        Self {
            stop: StopState::unset(TradeMode::Sell),
            key,
            mode: ModeState::Sell { ladder },
            stats: RunStatistics::default(),
            pending: None,
            completed: false,
            halted: None,
        }
    }

    pub fn new_buy(key: PairKey, range: DepositRange) -> Self {
        let stats = RunStatistics {
            deposit_price: Some(range.deposit_price),
            ..Default::default()
        };
        Self {
            stop: StopState::unset(TradeMode::Buy),
            key,
            mode: ModeState::Buy { range },
            stats,
            pending: None,
            completed: false,
            halted: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.completed && self.halted.is_none()
    }

    pub fn ladder(&self) -> Option<&ExitLadder> {
        match &self.mode {
            ModeState::Sell { ladder } => ladder.as_ref(),
            ModeState::Buy { .. } => None,
        }
    }

    pub fn range(&self) -> Option<&DepositRange> {
        match &self.mode {
            ModeState::Buy { range } => Some(range),
            ModeState::Sell { .. } => None,
        }
    }

    /// Apply a confirmed fill of the pending order and clear it
    pub fn apply_fill(&mut self, order: &PendingOrder, ack: &OrderAck) {
        let price = ack.average_price.unwrap_or(order.trigger_price);

        match &mut self.mode {
            ModeState::Sell { ladder } => {
                let base = ack.filled_size.unwrap_or(order.size.amount());
                self.stats.record_sell(base, price);
                match ladder {
                    Some(ladder) => {
                        ladder.record_sale(order.size.amount(), &ack.order_id);
                        self.completed = ladder.is_exhausted();
                    }
                    None => self.completed = true,
                }
            }
            ModeState::Buy { range } => {
                let quote = order.size.amount();
                let base = ack.filled_size.unwrap_or_else(|| {
                    if price.is_zero() {
                        Decimal::ZERO
                    } else {
                        quote / price
                    }
                });
                self.stats.record_buy(base, quote, price);
                range.completed = true;
                self.completed = true;
            }
        }

        self.pending = None;
    }
}

/// One price observation plus the inventory it may act on
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub price: Decimal,
    /// Base asset held (sell) or quote share allocated to this pair (buy)
    pub available: Decimal,
}

/// Notable transitions, for logging and reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickEvent {
    StopInitialized { stop: Decimal },
    StopRatcheted { from: Decimal, to: Decimal },
    ThresholdReleased { price: Decimal, amount: Decimal, hopper: Decimal },
    StopArmed { stop: Decimal, anchor: Decimal },
    Breakout { upper_bound: Decimal },
    Crossed { stop: Decimal },
    /// A trade was signalled but there was nothing to trade with
    NothingToTrade,
    /// A trade was signalled while an earlier order is still unconfirmed
    SuppressedByPending,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub state: PairState,
    pub events: Vec<TickEvent>,
    pub intent: Option<TradeIntent>,
}

/// What happened to a pair on one loop iteration
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub price: Option<Decimal>,
    pub released: usize,
    pub submitted: bool,
    pub filled_order_id: Option<String>,
    pub order_error: Option<String>,
}

/// Collaborators a tick needs
pub struct TickContext<'a> {
    pub exchange: &'a dyn Exchange,
    pub db: &'a Database,
    pub gate: &'a ExecutionGate,
    pub feed_retry: &'a RetryConfig,
}

pub struct StrategyEngine {
    policy: StopDistancePolicy,
    /// Fraction of the allocated quote share actually spent on a buy
    fee_buffer: Decimal,
    state: PairState,
}

impl StrategyEngine {
    pub fn new(policy: StopDistancePolicy, fee_buffer: Decimal, state: PairState) -> Self {
        Self {
            policy,
            fee_buffer,
            state,
        }
    }

    pub fn key(&self) -> &PairKey {
        &self.state.key
    }

    pub fn state(&self) -> &PairState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Mark halted in memory only, for when the store itself is failing
    pub fn halt_in_memory(&mut self, reason: String) {
        self.state.halted = Some(reason);
    }

    /// Advance the pair by one price observation
    pub fn evaluate(&self, state: &PairState, tick: &Tick) -> TickOutcome {
        let mut next = state.clone();
        let mut events = Vec::new();

        if !state.is_active() {
            return TickOutcome {
                state: next,
                events,
                intent: None,
            };
        }

        let signal = match &mut next.mode {
            ModeState::Sell { ladder } => {
                if let Some(ladder) = ladder.as_mut() {
                    for released in ladder.on_price(tick.price) {
                        events.push(TickEvent::ThresholdReleased {
                            price: released.price,
                            amount: released.release_amount,
                            hopper: ladder.hopper(),
                        });
                    }
                }

                let update = TrailingStopTracker::update(tick.price, &self.policy, &state.stop);
                push_stop_events(&mut events, &state.stop, &update.state, update.initialized);
                next.stop = update.state;

                if update.crossed {
                    events.push(TickEvent::Crossed {
                        stop: state.stop.current_stop.unwrap_or_default(),
                    });
                    let amount = match ladder {
                        Some(ladder) => ladder.on_stop_crossing(tick.available),
                        None => (tick.available > Decimal::ZERO).then_some(tick.available),
                    };
                    Some(amount.map(|a| (OrderSide::Sell, OrderSize::Base(a), TradeReason::StopCrossing)))
                } else {
                    None
                }
            }
            ModeState::Buy { range } => {
                let (next_range, action) = DepositRangeMonitor::on_price(tick.price, range);
                *range = next_range;
                let funds = tick.available * self.fee_buffer;
                let buy = (funds > Decimal::ZERO).then_some(OrderSize::Quote(funds));

                match action {
                    RangeAction::None => None,
                    RangeAction::BreakoutBuy => {
                        events.push(TickEvent::Breakout {
                            upper_bound: range.upper_bound,
                        });
                        Some(buy.map(|size| (OrderSide::Buy, size, TradeReason::Breakout)))
                    }
                    RangeAction::ArmStop => {
                        let anchored = StopState {
                            anchor_price: Some(range.deposit_price),
                            ..StopState::unset(TradeMode::Buy)
                        };
                        let update = TrailingStopTracker::update(tick.price, &self.policy, &anchored);
                        events.push(TickEvent::StopArmed {
                            stop: update.state.current_stop.unwrap_or_default(),
                            anchor: range.deposit_price,
                        });
                        next.stop = update.state;
                        None
                    }
                    RangeAction::DelegateToStopTracker => {
                        let update = TrailingStopTracker::update(tick.price, &self.policy, &state.stop);
                        push_stop_events(&mut events, &state.stop, &update.state, update.initialized);
                        next.stop = update.state;
                        if update.crossed {
                            events.push(TickEvent::Crossed {
                                stop: state.stop.current_stop.unwrap_or_default(),
                            });
                            Some(buy.map(|size| (OrderSide::Buy, size, TradeReason::StopCrossing)))
                        } else {
                            None
                        }
                    }
                }
            }
        };

        let intent = match signal {
            None => None,
            Some(None) => {
                events.push(TickEvent::NothingToTrade);
                None
            }
            Some(Some(_)) if state.pending.is_some() => {
                events.push(TickEvent::SuppressedByPending);
                None
            }
            Some(Some((side, size, reason))) => Some(TradeIntent {
                side,
                size,
                trigger_price: tick.price,
                reason,
            }),
        };

        TickOutcome {
            state: next,
            events,
            intent,
        }
    }

    /// Fetch, evaluate, persist, execute
    pub async fn tick(
        &mut self,
        ctx: &TickContext<'_>,
        buy_share: Option<Decimal>,
    ) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        if !self.is_active() {
            return Ok(report);
        }

        let key = self.state.key.clone();
        let price = with_retry(ctx.feed_retry, "price", || ctx.exchange.current_price(&key.symbol)).await?;
        let available = match key.mode {
            TradeMode::Sell => {
                with_retry(ctx.feed_retry, "balance", || ctx.exchange.available_balance(key.base())).await?
            }
            TradeMode::Buy => buy_share.unwrap_or(Decimal::ZERO),
        };
        report.price = Some(price);
        debug!("[Engine] {} price {} available {}", key, price, available);

        // An order carried over from an earlier tick is settled first
        if self.state.pending.is_some() {
            match ctx.gate.resume(&mut self.state).await {
                Ok(Some(order_id)) => report.filled_order_id = Some(order_id),
                Ok(None) => {}
                Err(ExecutionError::Order(e)) => report.order_error = Some(e.to_string()),
                Err(e) => return Err(e.into()),
            }
            if !self.is_active() {
                return Ok(report);
            }
        }

        let outcome = self.evaluate(&self.state, &Tick { price, available });
        for event in &outcome.events {
            log_event(&key, price, event);
            if matches!(event, TickEvent::ThresholdReleased { .. }) {
                report.released += 1;
            }
        }

        let mut next = outcome.state;
        if let Some(intent) = &outcome.intent {
            ctx.gate.stage(&mut next, intent);
        }

        if next != self.state {
            ctx.db.commit_tick(&next).await?;
            self.state = next;
        }

        if outcome.intent.is_some() {
            report.submitted = true;
            match ctx.gate.execute(&mut self.state).await {
                Ok(order_id) => report.filled_order_id = Some(order_id),
                Err(ExecutionError::Order(e)) => report.order_error = Some(e.to_string()),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}

fn push_stop_events(events: &mut Vec<TickEvent>, before: &StopState, after: &StopState, initialized: bool) {
    match (before.current_stop, after.current_stop) {
        (_, Some(stop)) if initialized => events.push(TickEvent::StopInitialized { stop }),
        (Some(from), Some(to)) if from != to => events.push(TickEvent::StopRatcheted { from, to }),
        _ => {}
    }
}

fn log_event(key: &PairKey, price: Decimal, event: &TickEvent) {
    match event {
        TickEvent::StopInitialized { stop } => {
            info!("[Engine] {} stop initialized at {} (price {})", key, stop, price)
        }
        TickEvent::StopRatcheted { from, to } => {
            let label = if to > from { "New high" } else { "New low" };
            info!("[Engine] {} {} observed at {}: stop {} -> {}", key, label, price, from, to)
        }
        TickEvent::ThresholdReleased { price: level, amount, hopper } => info!(
            "[Engine] {} threshold {} released {} (hopper {})",
            key, level, amount, hopper
        ),
        TickEvent::StopArmed { stop, anchor } => info!(
            "[Engine] {} price {} below range, stop armed at {} (deposit {})",
            key, price, stop, anchor
        ),
        TickEvent::Breakout { upper_bound } => {
            info!("[Engine] {} breakout: {} above {}", key, price, upper_bound)
        }
        TickEvent::Crossed { stop } => info!("[Engine] {} crossed stop {} at {}", key, stop, price),
        TickEvent::NothingToTrade => warn!("[Engine] {} signal at {} but nothing to trade", key, price),
        TickEvent::SuppressedByPending => {
            debug!("[Engine] {} signal at {} deferred to pending order", key, price)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitThreshold;
    use rust_decimal_macros::dec;

    fn sell_key() -> PairKey {
        PairKey::new("ETH/USD", TradeMode::Sell).unwrap()
    }

    fn scenario_ladder() -> ExitLadder {
        let rows = [(1, dec!(600)), (2, dec!(775))]
            .into_iter()
            .map(|(id, price)| ExitThreshold {
                id,
                price,
                release_amount: dec!(0.25),
                released: false,
                linked_order_id: None,
            })
            .collect();
        ExitLadder::new(rows, Decimal::ZERO).unwrap()
    }

    fn drive(engine: &StrategyEngine, mut state: PairState, ticks: &[(Decimal, Decimal)]) -> (PairState, Vec<TickOutcome>) {
        let mut outcomes = Vec::new();
        for (price, available) in ticks {
            let outcome = engine.evaluate(&state, &Tick { price: *price, available: *available });
            state = outcome.state.clone();
            outcomes.push(outcome);
        }
        (state, outcomes)
    }

    #[test]
    fn test_sell_ladder_scenario() {
        let state = PairState::new_sell(sell_key(), Some(scenario_ladder()));
        let engine = StrategyEngine::new(StopDistancePolicy::Percentage(dec!(0.05)), dec!(0.999), state.clone());

        let held = dec!(1);
        let (state, outcomes) = drive(
            &engine,
            state,
            &[(dec!(500), held), (dec!(620), held), (dec!(650), held), (dec!(590), held)],
        );

        assert!(outcomes[1].events.iter().any(|e| matches!(e, TickEvent::ThresholdReleased { hopper, .. } if *hopper == dec!(0.25))));
        assert_eq!(outcomes[2].state.stop.current_stop, Some(dec!(617.50)));
        assert!(outcomes[..3].iter().all(|o| o.intent.is_none()));

        let intent = outcomes[3].intent.clone().expect("crossing should sell");
        assert_eq!(intent.side, OrderSide::Sell);
        assert_eq!(intent.size, OrderSize::Base(dec!(0.25)));
        assert_eq!(intent.trigger_price, dec!(590));
        assert_eq!(intent.reason, TradeReason::StopCrossing);
        assert_eq!(state.ladder().unwrap().hopper(), dec!(0.25));
    }

    #[test]
    fn test_sell_crossing_with_empty_hopper_is_noop() {
        let state = PairState::new_sell(sell_key(), Some(scenario_ladder()));
        let engine = StrategyEngine::new(StopDistancePolicy::Absolute(dec!(10)), dec!(1), state.clone());
        let (_, outcomes) = drive(&engine, state, &[(dec!(500), dec!(1)), (dec!(480), dec!(1))]);
        assert!(outcomes[1].intent.is_none());
        assert!(outcomes[1].events.contains(&TickEvent::NothingToTrade));
    }

    #[test]
    fn test_simple_sell_uses_full_holding() {
        let state = PairState::new_sell(sell_key(), None);
        let engine = StrategyEngine::new(StopDistancePolicy::Absolute(dec!(100)), dec!(1), state.clone());
        let (_, outcomes) = drive(
            &engine,
            state,
            &[(dec!(10000), dec!(2)), (dec!(10200), dec!(2)), (dec!(10050), dec!(1.5))],
        );
        assert_eq!(outcomes[2].intent.as_ref().unwrap().size, OrderSize::Base(dec!(1.5)));
    }

    #[test]
    fn test_buy_range_scenario() {
        let key = PairKey::new("ETH/USD", TradeMode::Buy).unwrap();
        let policy = StopDistancePolicy::Percentage(dec!(0.10));
        let state = PairState::new_buy(key, DepositRange::new(dec!(1000), &policy));
        let engine = StrategyEngine::new(policy, dec!(1), state.clone());

        let share = dec!(500);
        let (state, outcomes) = drive(
            &engine,
            state,
            &[(dec!(1000), share), (dec!(950), share), (dec!(880), share), (dec!(1000), share)],
        );

        assert!(outcomes[..2].iter().all(|o| o.events.is_empty() && o.intent.is_none()));
        assert!(outcomes[2].events.contains(&TickEvent::StopArmed { stop: dec!(968.0), anchor: dec!(1000) }));
        assert_eq!(outcomes[2].state.stop.anchor_price, Some(dec!(1000)));
        assert!(outcomes[2].intent.is_none());

        let intent = outcomes[3].intent.clone().expect("crossing should buy");
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.size, OrderSize::Quote(share));
        assert!(state.range().unwrap().stop_armed);
    }

    #[test]
    fn test_buy_breakout_spends_share_with_fee_buffer() {
        let key = PairKey::new("ETH/USD", TradeMode::Buy).unwrap();
        let policy = StopDistancePolicy::Percentage(dec!(0.10));
        let state = PairState::new_buy(key, DepositRange::new(dec!(1000), &policy));
        let engine = StrategyEngine::new(policy, dec!(0.999), state.clone());

        let outcome = engine.evaluate(&state, &Tick { price: dec!(1150), available: dec!(1000) });
        let intent = outcome.intent.unwrap();
        assert_eq!(intent.reason, TradeReason::Breakout);
        assert_eq!(intent.size, OrderSize::Quote(dec!(999.000)));
        assert_eq!(outcome.state.stop.current_stop, None);
    }

    #[test]
    fn test_pending_order_suppresses_new_intent() {
        let state = PairState::new_sell(sell_key(), None);
        let engine = StrategyEngine::new(StopDistancePolicy::Absolute(dec!(10)), dec!(1), state.clone());
        let (mut state, _) = drive(&engine, state, &[(dec!(100), dec!(1))]);

        let intent = engine.evaluate(&state, &Tick { price: dec!(80), available: dec!(1) }).intent.unwrap();
        state.pending = Some(PendingOrder::from_intent(&intent));

        let outcome = engine.evaluate(&state, &Tick { price: dec!(70), available: dec!(1) });
        assert!(outcome.intent.is_none());
        assert!(outcome.events.contains(&TickEvent::SuppressedByPending));
        assert_eq!(outcome.state.pending, state.pending);
    }

    #[test]
    fn test_apply_fill_sell_and_buy() {
        let mut state = PairState::new_sell(sell_key(), Some(scenario_ladder()));
        if let ModeState::Sell { ladder: Some(ladder) } = &mut state.mode {
            ladder.on_price(dec!(620));
        }
        let order = PendingOrder::from_intent(&TradeIntent {
            side: OrderSide::Sell,
            size: OrderSize::Base(dec!(0.25)),
            trigger_price: dec!(590),
            reason: TradeReason::StopCrossing,
        });
        state.pending = Some(order.clone());
        let ack = OrderAck {
            order_id: "order-1".into(),
            client_order_id: order.client_order_id.clone(),
            average_price: Some(dec!(589)),
            filled_size: None,
        };
        state.apply_fill(&order, &ack);
        assert!(state.pending.is_none());
        assert_eq!(state.ladder().unwrap().hopper(), Decimal::ZERO);
        assert_eq!(state.stats.quote_volume, dec!(147.25));
        assert_eq!(state.stats.last_exit_price, Some(dec!(589)));
        assert!(!state.completed);

        let policy = StopDistancePolicy::Percentage(dec!(0.10));
        let mut buy = PairState::new_buy(PairKey::new("ETH/USD", TradeMode::Buy).unwrap(), DepositRange::new(dec!(1000), &policy));
        let order = PendingOrder::from_intent(&TradeIntent {
            side: OrderSide::Buy,
            size: OrderSize::Quote(dec!(500)),
            trigger_price: dec!(1000),
            reason: TradeReason::StopCrossing,
        });
        let ack = OrderAck {
            order_id: "order-2".into(),
            client_order_id: order.client_order_id.clone(),
            average_price: Some(dec!(970)),
            filled_size: None,
        };
        buy.apply_fill(&order, &ack);
        assert!(buy.completed);
        assert!(buy.range().unwrap().completed);
        assert_eq!(buy.stats.win_count, 1);
        assert_eq!(buy.stats.buy_count, 1);
    }
}
