//! Coinbase Advanced Trade REST adapter
//!
//! Every private request carries a short-lived ES256 JWT signed with the CDP
//! API key. Without credentials only the public market endpoints work, which
//! is what the paper exchange uses for prices.

use super::exchange::{product_id, Exchange, OrderAck, OrderRequest};
use super::exchange_errors::{
    feed_error_from_network, feed_error_from_response, order_error_from_failure, order_error_from_network,
    order_error_from_response,
};
use crate::error::{ConfigError, FeedError, OrderError};
use crate::types::OrderSize;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Method};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_API_URL: &str = "https://api.coinbase.com";

/// JWT lifetime accepted by the API
const JWT_TTL_SECS: i64 = 120;

/// How many recent orders to scan when reconciling by client order id
const ORDER_LOOKUP_LIMIT: u32 = 100;

struct Credentials {
    key_name: String,
    key: EncodingKey,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    sub: &'a str,
    iss: &'a str,
    nbf: i64,
    exp: i64,
    uri: String,
}

/// Size scales for one product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Increments {
    base_scale: u32,
    quote_scale: u32,
}

impl Default for Increments {
    fn default() -> Self {
        Self {
            base_scale: 8,
            quote_scale: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    base_increment: Option<String>,
    #[serde(default)]
    quote_increment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    has_next: bool,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Account {
    currency: String,
    available_balance: Balance,
}

#[derive(Debug, Deserialize)]
struct Balance {
    value: String,
}

impl Account {
    fn available(&self) -> Result<Decimal, FeedError> {
        Decimal::from_str(&self.available_balance.value)
            .map_err(|_| FeedError::Parse(format!("balance '{}'", self.available_balance.value)))
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    success_response: Option<SuccessResponse>,
    #[serde(default)]
    error_response: Option<Value>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: OrderDetails,
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<OrderDetails>,
}

#[derive(Debug, Deserialize)]
struct OrderDetails {
    order_id: String,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    average_filled_price: Option<String>,
    #[serde(default)]
    filled_size: Option<String>,
}

impl OrderDetails {
    fn into_ack(self) -> OrderAck {
        OrderAck {
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            average_price: parse_positive(self.average_filled_price.as_deref()),
            filled_size: parse_positive(self.filled_size.as_deref()),
        }
    }

    /// Terminal without any fill: the order never happened
    fn is_dead(&self) -> bool {
        matches!(self.status.as_str(), "FAILED" | "CANCELLED" | "EXPIRED")
            && parse_positive(self.filled_size.as_deref()).is_none()
    }

    /// Ack for an order that traded; an IOC that died unfilled is a rejection
    fn into_fill(self) -> Result<OrderAck, OrderError> {
        if self.is_dead() {
            return Err(OrderError::rejected(format!(
                "order {} {} without a fill",
                self.order_id,
                self.status.to_lowercase()
            )));
        }
        Ok(self.into_ack())
    }
}

fn parse_positive(value: Option<&str>) -> Option<Decimal> {
    value
        .and_then(|v| Decimal::from_str(v).ok())
        .filter(|d| *d > Decimal::ZERO)
}

/// Number of decimal places in an increment such as `0.00000001`
fn scale_of(increment: Option<&str>) -> Option<u32> {
    increment
        .and_then(|s| Decimal::from_str(s).ok())
        .map(|d| d.normalize().scale())
}

/// Round an order size down to what the product accepts
fn truncate(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

fn order_body(order: &OrderRequest, increments: Increments) -> Value {
    let configuration = match order.size {
        OrderSize::Base(base) => json!({ "base_size": truncate(base, increments.base_scale).to_string() }),
        OrderSize::Quote(quote) => json!({ "quote_size": truncate(quote, increments.quote_scale).to_string() }),
    };
    json!({
        "client_order_id": order.client_order_id,
        "product_id": product_id(&order.symbol),
        "side": order.side.as_str(),
        "order_configuration": { "market_market_ioc": configuration },
    })
}

pub struct CoinbaseExchange {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    increments: Arc<RwLock<HashMap<String, Increments>>>,
}

impl CoinbaseExchange {
    /// Authenticated client. `private_key_pem` must be a PKCS#8 EC key.
    pub fn new(base_url: &str, key_name: &str, private_key_pem: &str) -> Result<Self, ConfigError> {
        // Keys pasted into .env usually carry literal "\n"
        let pem = private_key_pem.replace("\\n", "\n");
        let key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("COINBASE_API_PRIVATE_KEY: {}", e)))?;

        let mut exchange = Self::public(base_url)?;
        exchange.credentials = Some(Credentials {
            key_name: key_name.to_string(),
            key,
        });
        Ok(exchange)
    }

    /// Unauthenticated client for public market data
    pub fn public(base_url: &str) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            increments: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn host(&self) -> &str {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    fn jwt(&self, credentials: &Credentials, method: &Method, path: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: &credentials.key_name,
            iss: "cdp",
            nbf: now,
            exp: now + JWT_TTL_SECS,
            uri: format!("{} {}{}", method, self.host(), path),
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(credentials.key_name.clone());
        jsonwebtoken::encode(&header, &claims, &credentials.key)
    }

    /// Build a request; private paths are signed, `query` is not part of the signature
    fn request(&self, method: Method, path: &str, query: &str) -> Result<reqwest::RequestBuilder, String> {
        let url = format!("{}{}{}", self.base_url, path, query);
        let builder = self.client.request(method.clone(), url);

        match &self.credentials {
            Some(credentials) => {
                let token = self.jwt(credentials, &method, path).map_err(|e| format!("JWT signing failed: {}", e))?;
                Ok(builder.bearer_auth(token))
            }
            None => Err("Coinbase API credentials are not configured".to_string()),
        }
    }

    async fn product_increments(&self, product: &str) -> Increments {
        {
            let cache = self.increments.read().await;
            if let Some(inc) = cache.get(product) {
                return *inc;
            }
        }

        match self.fetch_product(product).await {
            Ok(body) => {
                let defaults = Increments::default();
                let inc = Increments {
                    base_scale: scale_of(body.base_increment.as_deref()).unwrap_or(defaults.base_scale),
                    quote_scale: scale_of(body.quote_increment.as_deref()).unwrap_or(defaults.quote_scale),
                };
                debug!("[Coinbase] {} increments {:?}", product, inc);
                self.increments.write().await.insert(product.to_string(), inc);
                inc
            }
            Err(e) => {
                warn!("[Coinbase] Failed to fetch increments for {}: {}. Using defaults.", product, e);
                Increments::default()
            }
        }
    }

    async fn fetch_product(&self, product: &str) -> Result<ProductResponse, FeedError> {
        let response = match &self.credentials {
            Some(_) => {
                let path = format!("/api/v3/brokerage/products/{}", product);
                self.request(Method::GET, &path, "")
                    .map_err(FeedError::Request)?
                    .send()
                    .await
            }
            None => {
                let url = format!("{}/api/v3/brokerage/market/products/{}", self.base_url, product);
                self.client.get(&url).send().await
            }
        }
        .map_err(|e| feed_error_from_network(&e, product))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(feed_error_from_response(status.as_u16(), &body, product));
        }

        response
            .json::<ProductResponse>()
            .await
            .map_err(|e| FeedError::Parse(format!("product {}: {}", product, e)))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderDetails, OrderError> {
        let path = format!("/api/v3/brokerage/orders/historical/{}", order_id);
        let response = self
            .request(Method::GET, &path, "")
            .map_err(OrderError::rejected)?
            .send()
            .await
            .map_err(|e| order_error_from_network(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| order_error_from_network(&e))?;
        if !status.is_success() {
            return Err(order_error_from_response(status.as_u16(), &body));
        }

        serde_json::from_str::<OrderEnvelope>(&body)
            .map(|env| env.order)
            .map_err(|e| OrderError::network(format!("malformed order response: {}", e)))
    }

    /// One page of brokerage accounts
    async fn accounts_page(&self, cursor: Option<&str>) -> Result<AccountsResponse, FeedError> {
        let query = match cursor {
            Some(c) => format!("?limit=250&cursor={}", c),
            None => "?limit=250".to_string(),
        };
        let response = self
            .request(Method::GET, "/api/v3/brokerage/accounts", &query)
            .map_err(FeedError::Request)?
            .send()
            .await
            .map_err(|e| feed_error_from_network(&e, "accounts"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(feed_error_from_response(status.as_u16(), &body, "accounts"));
        }

        response
            .json()
            .await
            .map_err(|e| FeedError::Parse(format!("accounts: {}", e)))
    }
}

#[async_trait]
impl Exchange for CoinbaseExchange {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let product = product_id(symbol);
        let body = self.fetch_product(&product).await?;
        let price = body
            .price
            .ok_or_else(|| FeedError::Parse(format!("no price for {}", product)))?;
        Decimal::from_str(&price).map_err(|_| FeedError::Parse(format!("price '{}' for {}", price, product)))
    }

    async fn available_balance(&self, currency: &str) -> Result<Decimal, FeedError> {
        let mut cursor: Option<String> = None;

        loop {
            let page = self.accounts_page(cursor.as_deref()).await?;
            if let Some(account) = page.accounts.iter().find(|a| a.currency == currency) {
                return account.available();
            }

            match page.cursor {
                Some(next) if page.has_next && !next.is_empty() => cursor = Some(next),
                _ => return Ok(Decimal::ZERO),
            }
        }
    }

    async fn balances(&self) -> Result<Vec<(String, Decimal)>, FeedError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.accounts_page(cursor.as_deref()).await?;
            for account in &page.accounts {
                let amount = account.available()?;
                if amount > Decimal::ZERO {
                    all.push((account.currency.clone(), amount));
                }
            }

            match page.cursor {
                Some(next) if page.has_next && !next.is_empty() => cursor = Some(next),
                _ => return Ok(all),
            }
        }
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck, OrderError> {
        let product = product_id(&order.symbol);
        let increments = self.product_increments(&product).await;
        let body = order_body(order, increments);

        let response = self
            .request(Method::POST, "/api/v3/brokerage/orders", "")
            .map_err(OrderError::rejected)?
            .json(&body)
            .send()
            .await
            .map_err(|e| order_error_from_network(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| order_error_from_network(&e))?;
        if !status.is_success() {
            return Err(order_error_from_response(status.as_u16(), &text));
        }

        let parsed: CreateOrderResponse = serde_json::from_str(&text)
            .map_err(|e| OrderError::network(format!("malformed order response: {}", e)))?;

        let order_id = match (parsed.success, parsed.success_response) {
            (true, Some(success)) => success.order_id,
            _ => {
                let reason = parsed
                    .error_response
                    .map(|v| v.to_string())
                    .or(parsed.failure_reason)
                    .unwrap_or_else(|| "order not accepted".to_string());
                return Err(order_error_from_failure(&reason));
            }
        };

        info!(
            "[Coinbase] {} {} {} accepted as {}",
            product,
            order.side,
            order.size,
            order_id
        );

        // Fill details are best effort; the order stands either way
        match self.get_order(&order_id).await {
            Ok(details) => details.into_fill(),
            Err(e) => {
                warn!("[Coinbase] Could not fetch fill for {}: {}", order_id, e);
                Ok(OrderAck {
                    order_id,
                    client_order_id: order.client_order_id.clone(),
                    average_price: None,
                    filled_size: None,
                })
            }
        }
    }

    async fn find_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<OrderAck>, OrderError> {
        let query = format!("?product_ids={}&limit={}", product_id(symbol), ORDER_LOOKUP_LIMIT);
        let response = self
            .request(Method::GET, "/api/v3/brokerage/orders/historical/batch", &query)
            .map_err(OrderError::rejected)?
            .send()
            .await
            .map_err(|e| order_error_from_network(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| order_error_from_network(&e))?;
        if !status.is_success() {
            return Err(order_error_from_response(status.as_u16(), &body));
        }

        let parsed: OrdersResponse = serde_json::from_str(&body)
            .map_err(|e| OrderError::network(format!("malformed orders response: {}", e)))?;

        Ok(parsed
            .orders
            .into_iter()
            .find(|o| o.client_order_id == client_order_id && !o.is_dead())
            .map(OrderDetails::into_ack))
    }
}
