//! Exchange API Error Differentiation
//!
//! Parses error responses from the exchange REST API into `OrderError` so the
//! execution gate can tell a retryable failure from a terminal rejection.

use crate::error::{FeedError, OrderError, OrderErrorReason};
use serde::Deserialize;

/// Error body shapes returned by the brokerage API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_details: Option<String>,
    #[serde(default)]
    preview_failure_reason: Option<String>,
}

/// Parse an HTTP error response into a structured order error
pub fn order_error_from_response(status: u16, body: &str) -> OrderError {
    let error_msg = if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        [parsed.message, parsed.error_details, parsed.preview_failure_reason, parsed.error]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| body.to_string())
    } else {
        body.to_string()
    };

    OrderError::new(classify(status, &error_msg))
}

/// Classify an error message the exchange put in a 200 response
pub fn order_error_from_failure(reason: &str) -> OrderError {
    OrderError::new(classify(400, reason))
}

fn classify(status: u16, error_msg: &str) -> OrderErrorReason {
    let msg_lower = error_msg.to_lowercase();

    if status == 429 || msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
        return OrderErrorReason::RateLimited;
    }

    if msg_lower.contains("insufficient") || msg_lower.contains("not enough") {
        return OrderErrorReason::InsufficientFunds;
    }

    if status == 401 || status == 403 || msg_lower.contains("unauthorized") || msg_lower.contains("forbidden") {
        return OrderErrorReason::Rejected(format!("authentication failed: {}", error_msg));
    }

    if (400..500).contains(&status) {
        return OrderErrorReason::Rejected(error_msg.to_string());
    }

    OrderErrorReason::Unknown {
        status,
        body: error_msg.to_string(),
    }
}

/// Parse a network/reqwest error on the order path
pub fn order_error_from_network(err: &reqwest::Error) -> OrderError {
    if err.is_timeout() {
        OrderError::network("request timed out")
    } else if err.is_connect() {
        OrderError::network("connection failed")
    } else {
        OrderError::network(err.to_string())
    }
}

/// Parse a network/reqwest error on the feed path
pub fn feed_error_from_network(err: &reqwest::Error, what: &str) -> FeedError {
    if err.is_timeout() {
        FeedError::Timeout(what.to_string())
    } else {
        FeedError::Request(err.to_string())
    }
}

/// Non-success status on a price or balance request
pub fn feed_error_from_response(status: u16, body: &str, what: &str) -> FeedError {
    match status {
        404 => FeedError::InvalidSymbol(what.to_string()),
        408 | 504 => FeedError::Timeout(what.to_string()),
        _ => FeedError::Request(format!("{} returned {}: {}", what, status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited() {
        let err = order_error_from_response(429, "");
        assert!(err.is_retryable());
        assert_eq!(err.reason, OrderErrorReason::RateLimited);
    }

    #[test]
    fn test_insufficient_funds() {
        let err = order_error_from_response(400, r#"{"error":"INVALID_ARGUMENT","message":"Insufficient balance in source account"}"#);
        assert!(!err.is_retryable());
        assert_eq!(err.reason, OrderErrorReason::InsufficientFunds);

        let err = order_error_from_failure("INSUFFICIENT_FUND");
        assert_eq!(err.reason, OrderErrorReason::InsufficientFunds);
    }

    #[test]
    fn test_auth_is_terminal() {
        let err = order_error_from_response(401, "Unauthorized");
        assert!(matches!(err.reason, OrderErrorReason::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = order_error_from_response(503, "upstream unavailable");
        assert!(matches!(err.reason, OrderErrorReason::Unknown { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_feed_errors() {
        assert!(matches!(feed_error_from_response(404, "", "FOO-BAR"), FeedError::InvalidSymbol(_)));
        assert!(feed_error_from_response(504, "", "BTC-USD").is_retryable());
        assert!(feed_error_from_response(500, "oops", "BTC-USD").is_retryable());
    }
}
