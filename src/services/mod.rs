//! Exchange access and supporting services

pub mod coinbase;
pub mod exchange;
pub mod exchange_errors;
pub mod metrics;
pub mod paper;
pub mod retry;

#[cfg(test)]
pub mod mock;

pub use coinbase::CoinbaseExchange;
pub use exchange::{Exchange, OrderAck, OrderRequest};
pub use metrics::{Metrics, MetricsSnapshot};
pub use paper::PaperExchange;
pub use retry::{with_retry, RetryConfig, Retryable};
