//! Deposit range monitor (buy mode)
//!
//! Nothing happens while price stays inside the band around the deposit
//! price. A break above the band buys immediately. A drop below it arms a
//! downward-trailing stop, and from then on the stop tracker decides.
//! A round trades at most once.

use crate::types::DepositRange;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeAction {
    /// Inside the band, or the round is already done
    None,
    /// Price broke out above the upper bound: buy now
    BreakoutBuy,
    /// Price fell below the lower bound: arm the trailing stop this tick
    ArmStop,
    /// Stop already armed: the tracker owns this tick
    DelegateToStopTracker,
}

pub struct DepositRangeMonitor;

impl DepositRangeMonitor {
    /// Decide the action for a price and return the range as it stands after it
    pub fn on_price(price: Decimal, range: &DepositRange) -> (DepositRange, RangeAction) {
        let mut next = range.clone();

        if range.completed {
            return (next, RangeAction::None);
        }
        if range.stop_armed {
            return (next, RangeAction::DelegateToStopTracker);
        }

        if range.contains(price) {
            (next, RangeAction::None)
        } else if price > range.upper_bound {
            (next, RangeAction::BreakoutBuy)
        } else {
            next.stop_armed = true;
            (next, RangeAction::ArmStop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopDistancePolicy;
    use rust_decimal_macros::dec;

    fn range() -> DepositRange {
        DepositRange::new(dec!(1000), &StopDistancePolicy::Percentage(dec!(0.10)))
    }

    #[test]
    fn test_inside_band_is_quiet() {
        for price in [dec!(1000), dec!(950), dec!(900), dec!(1100)] {
            let (next, action) = DepositRangeMonitor::on_price(price, &range());
            assert_eq!(action, RangeAction::None);
            assert!(!next.stop_armed);
        }
    }

    #[test]
    fn test_breakout_above_upper_bound() {
        let (next, action) = DepositRangeMonitor::on_price(dec!(1100.01), &range());
        assert_eq!(action, RangeAction::BreakoutBuy);
        assert!(!next.stop_armed);
    }

    #[test]
    fn test_arms_once_below_lower_bound() {
        let (armed, action) = DepositRangeMonitor::on_price(dec!(880), &range());
        assert_eq!(action, RangeAction::ArmStop);
        assert!(armed.stop_armed);

        // Once armed, even a breakout-level price goes to the tracker
        let (_, action) = DepositRangeMonitor::on_price(dec!(1200), &armed);
        assert_eq!(action, RangeAction::DelegateToStopTracker);
        let (_, action) = DepositRangeMonitor::on_price(dec!(850), &armed);
        assert_eq!(action, RangeAction::DelegateToStopTracker);
    }

    #[test]
    fn test_completed_round_is_inert() {
        let mut done = range();
        done.completed = true;
        for price in [dec!(500), dec!(1000), dec!(2000)] {
            assert_eq!(DepositRangeMonitor::on_price(price, &done).1, RangeAction::None);
        }
    }
}
