//! Trailing Stop Bot Library
//!
//! Follows a market price with a trailing stop and trades when it is crossed:
//!
//! 1. **Sell mode**: an exit ladder of price thresholds releases base amounts
//!    into a hopper as the price climbs; a stop crossing sells the hopper.
//!
//! 2. **Buy mode**: a deposit range around a reference price arms a trailing
//!    stop when the price drops below it; the crossing (or a breakout above
//!    the range) spends the allocated quote share.
//!
//! Every state-changing tick is persisted before any order is submitted, so a
//! restart resumes from the last committed tick and never trades twice.

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod prompt;
pub mod runner;
pub mod services;
pub mod strategies;
pub mod types;
pub mod webhook;

pub use config::{Config, RunConfig};
pub use db::Database;
pub use executor::ExecutionGate;
pub use runner::PollLoop;
pub use strategies::{PairState, StrategyEngine};
pub use types::{PairKey, StopDistancePolicy, TradeMode};
pub use webhook::DiscordWebhook;
