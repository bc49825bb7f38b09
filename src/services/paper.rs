//! Paper trading exchange
//!
//! Real prices from a price source, simulated balances and instant fills at
//! the last seen price. Orders are idempotent on client order id, like the
//! live venue.
//!
//! Balances and orders live in memory only. A restart begins again from
//! `PAPER_BALANCES`, and an order left pending across the restart is not
//! found by `find_order`, so the gate submits it again against the fresh
//! balances.

use super::exchange::{Exchange, OrderAck, OrderRequest};
use crate::error::{FeedError, OrderError, OrderErrorReason};
use crate::types::{OrderSide, OrderSize};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct PaperExchange {
    prices: Arc<dyn Exchange>,
    balances: RwLock<HashMap<String, Decimal>>,
    last_prices: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<HashMap<String, OrderAck>>,
}

impl PaperExchange {
    pub fn new(prices: Arc<dyn Exchange>, balances: HashMap<String, Decimal>) -> Self {
        Self {
            prices,
            balances: RwLock::new(balances),
            last_prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
        }
    }

    async fn fill_price(&self, symbol: &str) -> Result<Decimal, OrderError> {
        if let Some(price) = self.last_prices.read().await.get(symbol) {
            return Ok(*price);
        }
        self.current_price(symbol)
            .await
            .map_err(|e| OrderError::network(e.to_string()))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let price = self.prices.current_price(symbol).await?;
        self.last_prices.write().await.insert(symbol.to_string(), price);
        Ok(price)
    }

    async fn available_balance(&self, currency: &str) -> Result<Decimal, FeedError> {
        Ok(self.balances.read().await.get(currency).copied().unwrap_or_default())
    }

    async fn balances(&self) -> Result<Vec<(String, Decimal)>, FeedError> {
        let mut all: Vec<_> = self
            .balances
            .read()
            .await
            .iter()
            .filter(|(_, amount)| **amount > Decimal::ZERO)
            .map(|(currency, amount)| (currency.clone(), *amount))
            .collect();
        all.sort();
        Ok(all)
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck, OrderError> {
        if let Some(existing) = self.orders.read().await.get(&order.client_order_id) {
            return Ok(existing.clone());
        }

        let price = self.fill_price(&order.symbol).await?;
        if price <= Decimal::ZERO {
            return Err(OrderError::rejected(format!("no usable price for {}", order.symbol)));
        }

        let (base_ccy, quote_ccy) = order
            .symbol
            .split_once('/')
            .ok_or_else(|| OrderError::rejected(format!("bad symbol {}", order.symbol)))?;
        let (base, quote) = match order.size {
            OrderSize::Base(base) => (base, base * price),
            OrderSize::Quote(quote) => (quote / price, quote),
        };
        let (debit_ccy, debit, credit_ccy, credit) = match order.side {
            OrderSide::Sell => (base_ccy, base, quote_ccy, quote),
            OrderSide::Buy => (quote_ccy, quote, base_ccy, base),
        };

        let mut balances = self.balances.write().await;
        let held = balances.get(debit_ccy).copied().unwrap_or_default();
        if held < debit {
            return Err(OrderError::new(OrderErrorReason::InsufficientFunds));
        }
        balances.insert(debit_ccy.to_string(), held - debit);
        *balances.entry(credit_ccy.to_string()).or_default() += credit;
        drop(balances);

        let ack = OrderAck {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            client_order_id: order.client_order_id.clone(),
            average_price: Some(price),
            filled_size: Some(base),
        };
        self.orders
            .write()
            .await
            .insert(order.client_order_id.clone(), ack.clone());

        info!(
            "[PAPER] {} {} {} at {} ({} {} -> {} {})",
            order.symbol, order.side, order.size, price, debit, debit_ccy, credit, credit_ccy
        );
        Ok(ack)
    }

    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<OrderAck>, OrderError> {
        Ok(self.orders.read().await.get(client_order_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::MockExchange;
    use rust_decimal_macros::dec;

    fn paper() -> PaperExchange {
        let prices = MockExchange::new().with_prices("BTC/USD", &[dec!(20000)]);
        let balances = HashMap::from([("USD".to_string(), dec!(1000)), ("BTC".to_string(), dec!(0.5))]);
        PaperExchange::new(Arc::new(prices), balances)
    }

    fn order(id: &str, side: OrderSide, size: OrderSize) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USD".into(),
            side,
            size,
            client_order_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_buy_and_sell_move_balances() {
        let exchange = paper();
        assert_eq!(exchange.current_price("BTC/USD").await.unwrap(), dec!(20000));

        let ack = exchange
            .place_market_order(&order("a", OrderSide::Buy, OrderSize::Quote(dec!(500))))
            .await
            .unwrap();
        assert_eq!(ack.filled_size, Some(dec!(0.025)));
        assert_eq!(exchange.available_balance("USD").await.unwrap(), dec!(500));
        assert_eq!(exchange.available_balance("BTC").await.unwrap(), dec!(0.525));

        exchange
            .place_market_order(&order("b", OrderSide::Sell, OrderSize::Base(dec!(0.025))))
            .await
            .unwrap();
        assert_eq!(exchange.available_balance("USD").await.unwrap(), dec!(1000));
        assert_eq!(
            exchange.balances().await.unwrap(),
            vec![("BTC".to_string(), dec!(0.5)), ("USD".to_string(), dec!(1000))]
        );
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_not_filled_twice() {
        let exchange = paper();
        let request = order("same", OrderSide::Sell, OrderSize::Base(dec!(0.1)));

        let first = exchange.place_market_order(&request).await.unwrap();
        let second = exchange.place_market_order(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.available_balance("BTC").await.unwrap(), dec!(0.4));
        assert_eq!(exchange.find_order("BTC/USD", "same").await.unwrap(), Some(first));
        assert_eq!(exchange.find_order("BTC/USD", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let exchange = paper();
        let err = exchange
            .place_market_order(&order("x", OrderSide::Sell, OrderSize::Base(dec!(1))))
            .await
            .unwrap_err();
        assert_eq!(err.reason, OrderErrorReason::InsufficientFunds);
        assert!(!err.is_retryable());
    }
}
