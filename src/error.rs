//! Error taxonomy for the trading core
//!
//! Feed errors are transient and cost one tick. Order errors go through the
//! execution gate's retry/halt policy. Persistence errors halt the affected
//! pair. Configuration errors are fatal at startup.

use std::fmt;
use thiserror::Error;

/// Price or balance retrieval failed
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("price feed timed out for {0}")]
    Timeout(String),

    #[error("unknown symbol or currency: {0}")]
    InvalidSymbol(String),

    #[error("feed request failed: {0}")]
    Request(String),

    #[error("malformed feed response: {0}")]
    Parse(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Timeout(_) | FeedError::Request(_))
    }
}

/// Why the exchange refused or failed an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderErrorReason {
    /// Not enough base or quote currency for the order
    InsufficientFunds,
    /// Exchange rejected the order (size, market state, auth...)
    Rejected(String),
    /// Rate limited by the exchange
    RateLimited,
    /// Timeout, DNS, connection reset
    Network(String),
    /// Anything else, with the raw status and body
    Unknown { status: u16, body: String },
}

impl fmt::Display for OrderErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderErrorReason::InsufficientFunds => write!(f, "insufficient funds"),
            OrderErrorReason::Rejected(msg) => write!(f, "rejected: {}", msg),
            OrderErrorReason::RateLimited => write!(f, "rate limited"),
            OrderErrorReason::Network(msg) => write!(f, "network error: {}", msg),
            OrderErrorReason::Unknown { status, body } => {
                write!(f, "exchange error {}: {}", status, body)
            }
        }
    }
}

/// Order placement or lookup failed
#[derive(Debug, Clone, Error)]
#[error("order failed: {reason}")]
pub struct OrderError {
    pub reason: OrderErrorReason,
}

impl OrderError {
    pub fn new(reason: OrderErrorReason) -> Self {
        Self { reason }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(OrderErrorReason::Network(msg.into()))
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(OrderErrorReason::Rejected(msg.into()))
    }

    /// Whether resubmitting the same order on a later tick can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            OrderErrorReason::RateLimited
                | OrderErrorReason::Network(_)
                | OrderErrorReason::Unknown { .. }
        )
    }
}

/// Durable state could not be read or written
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt value in column {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },

    #[error("instance lock for {symbol} {mode} held by pid {pid:?}")]
    LockHeld {
        symbol: String,
        mode: String,
        pid: Option<i64>,
    },

    #[error("no persisted state for {0}")]
    Missing(String),
}

/// Invalid run configuration, rejected before the loop starts
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("percentage stop distance must be in (0, 1), got {0}")]
    InvalidPercentage(String),

    #[error("absolute stop distance must be positive, got {0}")]
    InvalidDistance(String),

    #[error("invalid trade type '{0}' (expected 'buy' or 'sell')")]
    InvalidTradeType(String),

    #[error("invalid symbol '{0}' (expected BASE/QUOTE, e.g. BTC/USD)")]
    InvalidSymbol(String),

    #[error("invalid ladder entry #{index} '{entry}': {reason}")]
    InvalidLadderEntry {
        index: usize,
        entry: String,
        reason: String,
    },

    #[error("invalid threshold row {id}: {reason}")]
    InvalidThreshold { id: i64, reason: String },

    #[error("fund split {split} is smaller than the {symbols} buy symbols in this run")]
    SplitTooSmall { split: u32, symbols: usize },

    #[error("{0}")]
    Invalid(String),
}

/// Outcome of an execution gate call that did not produce a fill
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("pair halted: {reason}")]
    Halted { reason: String },
}

/// Failure of a single pair tick
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_error_retryable() {
        assert!(OrderError::network("timeout").is_retryable());
        assert!(OrderError::new(OrderErrorReason::RateLimited).is_retryable());
        assert!(!OrderError::new(OrderErrorReason::InsufficientFunds).is_retryable());
        assert!(!OrderError::rejected("size too small").is_retryable());
    }

    #[test]
    fn test_feed_error_retryable() {
        assert!(FeedError::Timeout("BTC/USD".into()).is_retryable());
        assert!(!FeedError::InvalidSymbol("FOO/BAR".into()).is_retryable());
    }

    #[test]
    fn test_order_error_display() {
        let err = OrderError::new(OrderErrorReason::InsufficientFunds);
        assert_eq!(err.to_string(), "order failed: insufficient funds");
    }
}
