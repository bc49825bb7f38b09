//! Trading strategies: trailing stop, exit ladder and deposit range

pub mod deposit_range;
pub mod engine;
pub mod exit_ladder;
pub mod trailing_stop;

pub use deposit_range::{DepositRangeMonitor, RangeAction};
pub use engine::{ModeState, PairState, StrategyEngine, Tick, TickContext, TickEvent, TickOutcome, TickReport};
pub use exit_ladder::{default_ladder, parse_ladder_spec, resolve_entries, ExitLadder, LadderEntry, LadderPrice};
pub use trailing_stop::{StopUpdate, TrailingStopTracker};
