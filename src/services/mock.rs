//! Scripted exchange for tests
//!
//! Prices are consumed from a per-symbol queue (the last one repeats), order
//! failures are injected from a queue, and every submission is recorded.

use super::exchange::{Exchange, OrderAck, OrderRequest};
use crate::error::{FeedError, OrderError};
use crate::types::{OrderSide, OrderSize};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Fail without creating an order
    Reject(OrderError),
    /// Create the order, then report a failure (lost response)
    AcceptThenFail(OrderError),
}

#[derive(Debug, Default, Clone)]
pub struct MockExchange {
    prices: Arc<Mutex<HashMap<String, VecDeque<Decimal>>>>,
    last_prices: Arc<Mutex<HashMap<String, Decimal>>>,
    balances: Arc<Mutex<HashMap<String, Decimal>>>,
    failures: Arc<Mutex<VecDeque<InjectedFailure>>>,
    orders: Arc<Mutex<HashMap<String, OrderAck>>>,
    submissions: Arc<Mutex<Vec<OrderRequest>>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices(self, symbol: &str, prices: &[Decimal]) -> Self {
        self.prices
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(prices.iter().copied());
        self
    }

    pub fn with_balance(self, currency: &str, amount: Decimal) -> Self {
        self.balances.lock().unwrap().insert(currency.to_string(), amount);
        self
    }

    pub fn push_prices(&self, symbol: &str, prices: &[Decimal]) {
        self.prices
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(prices.iter().copied());
    }

    pub fn fail_next_order(&self, failure: InjectedFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.balances.lock().unwrap().insert(currency.to_string(), amount);
    }

    pub fn balance(&self, currency: &str) -> Decimal {
        self.balances.lock().unwrap().get(currency).copied().unwrap_or_default()
    }

    /// Every call to `place_market_order`, including failed and duplicate ones
    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.submissions.lock().unwrap().clone()
    }

    /// Orders that actually exist on the exchange
    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    fn create_order(&self, order: &OrderRequest) -> OrderAck {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get(&order.client_order_id) {
            return existing.clone();
        }

        let price = self
            .last_prices
            .lock()
            .unwrap()
            .get(&order.symbol)
            .copied()
            .unwrap_or(Decimal::ONE);
        let (base, quote) = match order.size {
            OrderSize::Base(base) => (base, base * price),
            OrderSize::Quote(quote) => (quote / price, quote),
        };

        let mut parts = order.symbol.split('/');
        let base_ccy = parts.next().unwrap_or_default().to_string();
        let quote_ccy = parts.next().unwrap_or_default().to_string();
        let mut balances = self.balances.lock().unwrap();
        let (debit, credit) = match order.side {
            OrderSide::Sell => ((base_ccy, base), (quote_ccy, quote)),
            OrderSide::Buy => ((quote_ccy, quote), (base_ccy, base)),
        };
        *balances.entry(debit.0).or_default() -= debit.1;
        *balances.entry(credit.0).or_default() += credit.1;

        let ack = OrderAck {
            order_id: format!("mock-{}", orders.len() + 1),
            client_order_id: order.client_order_id.clone(),
            average_price: Some(price),
            filled_size: Some(base),
        };
        orders.insert(order.client_order_id.clone(), ack.clone());
        ack
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let mut prices = self.prices.lock().unwrap();
        let queue = prices
            .get_mut(symbol)
            .ok_or_else(|| FeedError::InvalidSymbol(symbol.to_string()))?;
        let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        let price = next.ok_or_else(|| FeedError::Request(format!("no price scripted for {}", symbol)))?;
        self.last_prices.lock().unwrap().insert(symbol.to_string(), price);
        Ok(price)
    }

    async fn available_balance(&self, currency: &str) -> Result<Decimal, FeedError> {
        Ok(self.balance(currency))
    }

    async fn balances(&self) -> Result<Vec<(String, Decimal)>, FeedError> {
        let mut all: Vec<_> = self
            .balances
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, amount)| **amount > Decimal::ZERO)
            .map(|(currency, amount)| (currency.clone(), *amount))
            .collect();
        all.sort();
        Ok(all)
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck, OrderError> {
        self.submissions.lock().unwrap().push(order.clone());

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(InjectedFailure::Reject(err)) => Err(err),
            Some(InjectedFailure::AcceptThenFail(err)) => {
                self.create_order(order);
                Err(err)
            }
            None => Ok(self.create_order(order)),
        }
    }

    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<OrderAck>, OrderError> {
        Ok(self.orders.lock().unwrap().get(client_order_id).cloned())
    }
}
