//! Core types for the trailing stop bot

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Run mode of a pair, which is also the direction its stop trails in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeMode {
    /// Accumulate on dips below the deposit range; stop trails downward
    Buy,
    /// Release ladder inventory as price rises; stop trails upward
    Sell,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Buy => "buy",
            TradeMode::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TradeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(TradeMode::Buy),
            "sell" => Ok(TradeMode::Sell),
            other => Err(ConfigError::InvalidTradeType(other.to_string())),
        }
    }
}

/// Order side sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side {}", other)),
        }
    }
}

/// Identity of one tracked pair: market symbol plus mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    /// Market symbol in BASE/QUOTE form, e.g. `BTC/USD`
    pub symbol: String,
    pub mode: TradeMode,
}

impl PairKey {
    /// Build a key, validating the BASE/QUOTE shape of the symbol
    pub fn new(symbol: &str, mode: TradeMode) -> Result<Self, ConfigError> {
        let symbol = symbol.trim().to_uppercase();
        match symbol.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() && !quote.contains('/') => {
                Ok(Self { symbol, mode })
            }
            _ => Err(ConfigError::InvalidSymbol(symbol)),
        }
    }

    /// Base asset (`BTC` in `BTC/USD`)
    pub fn base(&self) -> &str {
        self.symbol.split('/').next().unwrap_or(&self.symbol)
    }

    /// Quote currency (`USD` in `BTC/USD`)
    pub fn quote(&self) -> &str {
        self.symbol.split('/').nth(1).unwrap_or(&self.symbol)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.mode)
    }
}

/// How far the stop sits from the price. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopDistancePolicy {
    /// Fraction of the current price, recomputed every tick
    Percentage(Decimal),
    /// Constant distance in quote currency units
    Absolute(Decimal),
}

impl StopDistancePolicy {
    pub fn percentage(fraction: Decimal) -> Result<Self, ConfigError> {
        if fraction <= Decimal::ZERO || fraction >= Decimal::ONE {
            return Err(ConfigError::InvalidPercentage(fraction.to_string()));
        }
        Ok(StopDistancePolicy::Percentage(fraction))
    }

    pub fn absolute(amount: Decimal) -> Result<Self, ConfigError> {
        if amount <= Decimal::ZERO {
            return Err(ConfigError::InvalidDistance(amount.to_string()));
        }
        Ok(StopDistancePolicy::Absolute(amount))
    }

    /// Concrete distance at the given price
    pub fn distance(&self, price: Decimal) -> Decimal {
        match self {
            StopDistancePolicy::Percentage(fraction) => price * fraction,
            StopDistancePolicy::Absolute(amount) => *amount,
        }
    }
}

impl fmt::Display for StopDistancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopDistancePolicy::Percentage(fraction) => {
                write!(f, "{}%", (fraction * Decimal::ONE_HUNDRED).normalize())
            }
            StopDistancePolicy::Absolute(amount) => write!(f, "{} absolute", amount.normalize()),
        }
    }
}

/// Trailing stop boundary of a pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopState {
    pub direction: TradeMode,
    /// Unset until the tracker has seen its first qualifying price
    pub current_stop: Option<Decimal>,
    pub armed: bool,
    /// Reference price the stop was armed against (deposit price in buy mode)
    pub anchor_price: Option<Decimal>,
}

impl StopState {
    pub fn unset(direction: TradeMode) -> Self {
        Self {
            direction,
            current_stop: None,
            armed: false,
            anchor_price: None,
        }
    }
}

/// One rung of the sell-mode exit ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitThreshold {
    /// Row id, also the tie-breaker for equal prices
    pub id: i64,
    pub price: Decimal,
    pub release_amount: Decimal,
    pub released: bool,
    /// Sell order that consumed this threshold's release
    pub linked_order_id: Option<String>,
}

/// Buy-mode band around the deposit reference price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRange {
    pub deposit_price: Decimal,
    pub upper_bound: Decimal,
    pub lower_bound: Decimal,
    pub stop_armed: bool,
    /// Set once the round's single trade has filled
    pub completed: bool,
}

impl DepositRange {
    /// Bounds are computed once from the deposit price and never move
    pub fn new(deposit_price: Decimal, policy: &StopDistancePolicy) -> Self {
        let distance = policy.distance(deposit_price);
        Self {
            deposit_price,
            upper_bound: deposit_price + distance,
            lower_bound: deposit_price - distance,
            stop_armed: false,
            completed: false,
        }
    }

    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.lower_bound && price <= self.upper_bound
    }
}

/// Cumulative per-pair trade statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub trades_executed: i64,
    /// Base asset bought or sold
    pub base_volume: Decimal,
    /// Quote currency spent or received
    pub quote_volume: Decimal,
    pub last_entry_price: Option<Decimal>,
    pub last_exit_price: Option<Decimal>,
    /// Deposit price of the current buy round
    pub deposit_price: Option<Decimal>,
    pub buy_count: i64,
    /// Buys filled below their round's deposit price
    pub win_count: i64,
}

impl RunStatistics {
    pub fn record_buy(&mut self, base: Decimal, quote: Decimal, price: Decimal) {
        self.trades_executed += 1;
        self.base_volume += base;
        self.quote_volume += quote;
        self.last_entry_price = Some(price);
        self.buy_count += 1;
        if let Some(deposit) = self.deposit_price {
            if price < deposit {
                self.win_count += 1;
            }
        }
    }

    pub fn record_sell(&mut self, base: Decimal, price: Decimal) {
        self.trades_executed += 1;
        self.base_volume += base;
        self.quote_volume += base * price;
        self.last_exit_price = Some(price);
    }

    /// Win rate over buys, as a percentage
    pub fn win_rate(&self) -> Option<Decimal> {
        if self.buy_count == 0 {
            return None;
        }
        Some(Decimal::from(self.win_count) * Decimal::ONE_HUNDRED / Decimal::from(self.buy_count))
    }
}

/// Order amount, denominated in base asset (sells) or quote currency (buys)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSize {
    Base(Decimal),
    Quote(Decimal),
}

impl OrderSize {
    pub fn amount(&self) -> Decimal {
        match self {
            OrderSize::Base(amount) | OrderSize::Quote(amount) => *amount,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            OrderSize::Base(_) => "base",
            OrderSize::Quote(_) => "quote",
        }
    }

    pub fn from_parts(unit: &str, amount: Decimal) -> Option<Self> {
        match unit {
            "base" => Some(OrderSize::Base(amount)),
            "quote" => Some(OrderSize::Quote(amount)),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount().normalize(), self.unit())
    }
}

/// What produced a trade intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeReason {
    /// Price moved through the trailing stop
    StopCrossing,
    /// Buy mode: price broke out above the deposit range
    Breakout,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::StopCrossing => "stop_crossing",
            TradeReason::Breakout => "breakout",
        }
    }
}

impl FromStr for TradeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_crossing" => Ok(TradeReason::StopCrossing),
            "breakout" => Ok(TradeReason::Breakout),
            other => Err(format!("unknown trade reason {}", other)),
        }
    }
}

/// A trade the strategy wants executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeIntent {
    pub side: OrderSide,
    pub size: OrderSize,
    /// Price of the tick that produced the intent
    pub trigger_price: Decimal,
    pub reason: TradeReason,
}

/// A trade intent staged for execution, persisted before it is submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrder {
    /// Idempotency key sent to the exchange; resubmissions reuse it
    pub client_order_id: String,
    pub side: OrderSide,
    pub size: OrderSize,
    pub trigger_price: Decimal,
    pub reason: TradeReason,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the gate may try again after a failure
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn from_intent(intent: &TradeIntent) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            side: intent.side,
            size: intent.size,
            trigger_price: intent.trigger_price,
            reason: intent.reason,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether a retry is allowed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|at| now >= at).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_key_parsing() {
        let key = PairKey::new("btc/usd", TradeMode::Sell).unwrap();
        assert_eq!(key.symbol, "BTC/USD");
        assert_eq!(key.base(), "BTC");
        assert_eq!(key.quote(), "USD");

        assert!(PairKey::new("BTCUSD", TradeMode::Buy).is_err());
        assert!(PairKey::new("/USD", TradeMode::Buy).is_err());
        assert!(PairKey::new("A/B/C", TradeMode::Buy).is_err());
    }

    #[test]
    fn test_policy_validation() {
        assert!(StopDistancePolicy::percentage(dec!(0.05)).is_ok());
        assert!(StopDistancePolicy::percentage(dec!(0)).is_err());
        assert!(StopDistancePolicy::percentage(dec!(1)).is_err());
        assert!(StopDistancePolicy::absolute(dec!(100)).is_ok());
        assert!(StopDistancePolicy::absolute(dec!(-1)).is_err());
    }

    #[test]
    fn test_policy_distance() {
        let pct = StopDistancePolicy::Percentage(dec!(0.05));
        assert_eq!(pct.distance(dec!(650)), dec!(32.50));
        assert_eq!(pct.distance(dec!(1000)), dec!(50));

        let abs = StopDistancePolicy::Absolute(dec!(100));
        assert_eq!(abs.distance(dec!(10000)), dec!(100));
        assert_eq!(abs.distance(dec!(1)), dec!(100));
    }

    #[test]
    fn test_deposit_range_bounds() {
        let range = DepositRange::new(dec!(1000), &StopDistancePolicy::Percentage(dec!(0.10)));
        assert_eq!(range.upper_bound, dec!(1100));
        assert_eq!(range.lower_bound, dec!(900));
        assert!(range.contains(dec!(900)));
        assert!(range.contains(dec!(1100)));
        assert!(!range.contains(dec!(899.99)));
    }

    #[test]
    fn test_win_tracking() {
        let mut stats = RunStatistics {
            deposit_price: Some(dec!(1000)),
            ..Default::default()
        };
        stats.record_buy(dec!(0.1), dec!(95), dec!(950));
        stats.record_buy(dec!(0.1), dec!(105), dec!(1050));
        assert_eq!(stats.buy_count, 2);
        assert_eq!(stats.win_count, 1);
        assert_eq!(stats.win_rate(), Some(dec!(50)));
        assert_eq!(stats.trades_executed, 2);
    }

    #[test]
    fn test_pending_order_due() {
        let intent = TradeIntent {
            side: OrderSide::Sell,
            size: OrderSize::Base(dec!(0.25)),
            trigger_price: dec!(590),
            reason: TradeReason::StopCrossing,
        };
        let mut pending = PendingOrder::from_intent(&intent);
        let now = Utc::now();
        assert!(pending.is_due(now));

        pending.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!pending.is_due(now));
        assert!(pending.is_due(now + chrono::Duration::seconds(31)));
    }
}
