//! Exchange port
//!
//! Everything the bot needs from a venue: a spot price, available balances,
//! idempotent market orders keyed by client order id, and a lookup of an
//! order by that id for reconciling after a crash or an ambiguous failure.

use crate::error::{FeedError, OrderError};
use crate::types::{OrderSide, OrderSize};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Market order as submitted to the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// BASE/QUOTE symbol
    pub symbol: String,
    pub side: OrderSide,
    pub size: OrderSize,
    /// Idempotency key; the exchange must not create a second order for it
    pub client_order_id: String,
}

/// Exchange acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    /// Average fill price when the exchange reports it
    pub average_price: Option<Decimal>,
    /// Filled base quantity when the exchange reports it
    pub filled_size: Option<Decimal>,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short venue name for logs
    fn name(&self) -> &'static str;

    /// Latest trade price for a BASE/QUOTE symbol
    async fn current_price(&self, symbol: &str) -> Result<Decimal, FeedError>;

    /// Available (not on hold) balance of one currency
    async fn available_balance(&self, currency: &str) -> Result<Decimal, FeedError>;

    /// Every non-zero available balance, by currency
    async fn balances(&self) -> Result<Vec<(String, Decimal)>, FeedError>;

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck, OrderError>;

    /// Order previously placed with this client order id, if any
    async fn find_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<OrderAck>, OrderError>;
}

/// Currencies treated as cash rather than something to sell
pub const QUOTE_CURRENCIES: [&str; 5] = ["USD", "USDT", "USDC", "EUR", "GBP"];

/// Held non-quote assets, sorted by currency
pub async fn sellable_assets(exchange: &dyn Exchange) -> Result<Vec<(String, Decimal)>, FeedError> {
    let mut assets: Vec<(String, Decimal)> = exchange
        .balances()
        .await?
        .into_iter()
        .filter(|(currency, amount)| *amount > Decimal::ZERO && !QUOTE_CURRENCIES.contains(&currency.as_str()))
        .collect();
    assets.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(assets)
}

/// `BTC/USD` -> `BTC-USD`
pub fn product_id(symbol: &str) -> String {
    symbol.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::MockExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_id() {
        assert_eq!(product_id("BTC/USD"), "BTC-USD");
        assert_eq!(product_id("ETH-USD"), "ETH-USD");
    }

    #[tokio::test]
    async fn test_sellable_assets_skip_cash_and_empty() {
        let mock = MockExchange::new()
            .with_balance("USD", dec!(1000))
            .with_balance("USDC", dec!(50))
            .with_balance("SOL", dec!(3))
            .with_balance("BTC", dec!(0.5))
            .with_balance("DOGE", dec!(0));

        let assets = sellable_assets(&mock).await.unwrap();
        assert_eq!(assets, vec![("BTC".to_string(), dec!(0.5)), ("SOL".to_string(), dec!(3))]);
    }
}
