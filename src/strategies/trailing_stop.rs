//! Trailing stop tracker
//!
//! Pure stop arithmetic: given a price, the distance policy and the previous
//! stop, computes the next stop and whether the price went through it.
//!
//! - Sell: stop = price - distance, ratchets up only. Crossed when
//!   price <= previous stop.
//! - Buy: stop = price + distance, ratchets down only. Crossed when
//!   price >= previous stop.
//!
//! Because the candidate stop always sits on the far side of the price,
//! comparing against the previous stop or against the ratcheted one gives
//! the same answer (see `test_crossing_matches_ratcheted_stop`).

use crate::types::{StopDistancePolicy, StopState, TradeMode};
use rust_decimal::Decimal;

/// Result of feeding one price into the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopUpdate {
    pub state: StopState,
    pub crossed: bool,
    /// The stop was set for the first time on this tick
    pub initialized: bool,
    /// The stop moved in the favorable direction on this tick
    pub ratcheted: bool,
}

pub struct TrailingStopTracker;

impl TrailingStopTracker {
    /// Candidate stop for a price, before ratcheting
    pub fn candidate(direction: TradeMode, price: Decimal, policy: &StopDistancePolicy) -> Decimal {
        let distance = policy.distance(price);
        match direction {
            TradeMode::Sell => price - distance,
            TradeMode::Buy => price + distance,
        }
    }

    pub fn update(price: Decimal, policy: &StopDistancePolicy, previous: &StopState) -> StopUpdate {
        let candidate = Self::candidate(previous.direction, price, policy);

        let Some(prev_stop) = previous.current_stop else {
            return StopUpdate {
                state: StopState {
                    current_stop: Some(candidate),
                    armed: true,
                    ..previous.clone()
                },
                crossed: false,
                initialized: true,
                ratcheted: false,
            };
        };

        let (new_stop, crossed) = match previous.direction {
            TradeMode::Sell => (prev_stop.max(candidate), price <= prev_stop),
            TradeMode::Buy => (prev_stop.min(candidate), price >= prev_stop),
        };

        StopUpdate {
            state: StopState {
                current_stop: Some(new_stop),
                armed: true,
                ..previous.clone()
            },
            crossed,
            initialized: false,
            ratcheted: new_stop != prev_stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn run(direction: TradeMode, policy: StopDistancePolicy, prices: &[Decimal]) -> Vec<StopUpdate> {
        let mut state = StopState::unset(direction);
        prices
            .iter()
            .map(|price| {
                let update = TrailingStopTracker::update(*price, &policy, &state);
                state = update.state.clone();
                update
            })
            .collect()
    }

    #[test]
    fn test_first_price_initializes_without_crossing() {
        let policy = StopDistancePolicy::Percentage(dec!(0.05));
        let update = TrailingStopTracker::update(dec!(500), &policy, &StopState::unset(TradeMode::Sell));
        assert_eq!(update.state.current_stop, Some(dec!(475.00)));
        assert!(update.initialized);
        assert!(update.state.armed);
        assert!(!update.crossed);

        let update = TrailingStopTracker::update(dec!(880), &StopDistancePolicy::Percentage(dec!(0.10)), &StopState::unset(TradeMode::Buy));
        assert_eq!(update.state.current_stop, Some(dec!(968.0)));
        assert!(!update.crossed);
    }

    #[test]
    fn test_sell_percentage_scenario() {
        let updates = run(
            TradeMode::Sell,
            StopDistancePolicy::Percentage(dec!(0.05)),
            &[dec!(500), dec!(620), dec!(650), dec!(590)],
        );
        assert_eq!(updates[1].state.current_stop, Some(dec!(589.00)));
        assert_eq!(updates[2].state.current_stop, Some(dec!(617.50)));
        assert!(!updates[2].crossed);
        assert!(updates[3].crossed);
        // Stop never retreats on the crossing tick
        assert_eq!(updates[3].state.current_stop, Some(dec!(617.50)));
    }

    #[test]
    fn test_buy_crossing_against_previous_ceiling() {
        let updates = run(
            TradeMode::Buy,
            StopDistancePolicy::Percentage(dec!(0.10)),
            &[dec!(880), dec!(1000)],
        );
        assert_eq!(updates[0].state.current_stop, Some(dec!(968.0)));
        assert!(updates[1].crossed);
    }

    #[test]
    fn test_buy_ratchets_down() {
        let updates = run(
            TradeMode::Buy,
            StopDistancePolicy::Absolute(dec!(10)),
            &[dec!(100), dec!(95), dec!(97), dec!(90)],
        );
        let stops: Vec<_> = updates.iter().map(|u| u.state.current_stop.unwrap()).collect();
        assert_eq!(stops, vec![dec!(110), dec!(105), dec!(105), dec!(100)]);
        assert!(updates.iter().all(|u| !u.crossed));
        assert!(!updates[2].ratcheted);
        assert!(updates[3].ratcheted);
    }

    #[test]
    fn test_absolute_and_percentage_differ_in_outcome_only() {
        let prices = [dec!(10000), dec!(10200), dec!(10050)];

        let absolute = run(TradeMode::Sell, StopDistancePolicy::Absolute(dec!(100)), &prices);
        assert_eq!(absolute[0].state.current_stop, Some(dec!(9900)));
        assert_eq!(absolute[1].state.current_stop, Some(dec!(10100)));
        assert!(absolute[2].crossed);

        let percentage = run(TradeMode::Sell, StopDistancePolicy::Percentage(dec!(0.05)), &prices);
        assert_eq!(percentage[1].state.current_stop, Some(dec!(9690.00)));
        assert!(!percentage[2].crossed);

        // A pull-back that stays above the locked floor does not cross
        let shallow = run(TradeMode::Sell, StopDistancePolicy::Absolute(dec!(100)), &[dec!(10000), dec!(10200), dec!(10150)]);
        assert!(!shallow[2].crossed);
        assert_eq!(shallow[2].state.current_stop, Some(dec!(10100)));
    }

    #[test]
    fn test_price_equal_to_stop_crosses() {
        let policy = StopDistancePolicy::Absolute(dec!(5));
        let state = StopState {
            current_stop: Some(dec!(95)),
            armed: true,
            ..StopState::unset(TradeMode::Sell)
        };
        assert!(TrailingStopTracker::update(dec!(95), &policy, &state).crossed);

        let state = StopState {
            current_stop: Some(dec!(105)),
            armed: true,
            ..StopState::unset(TradeMode::Buy)
        };
        assert!(TrailingStopTracker::update(dec!(105), &policy, &state).crossed);
    }

    fn price_strategy() -> impl Strategy<Value = Vec<Decimal>> {
        prop::collection::vec(1u32..1_000_000u32, 1..60)
            .prop_map(|cents| cents.into_iter().map(|c| Decimal::new(c as i64, 2)).collect())
    }

    fn policy_strategy() -> impl Strategy<Value = StopDistancePolicy> {
        prop_oneof![
            (1u32..99u32).prop_map(|p| StopDistancePolicy::Percentage(Decimal::new(p as i64, 2))),
            (1u32..100_000u32).prop_map(|a| StopDistancePolicy::Absolute(Decimal::new(a as i64, 2))),
        ]
    }

    proptest! {
        #[test]
        fn prop_sell_stop_is_non_decreasing(prices in price_strategy(), policy in policy_strategy()) {
            let updates = run(TradeMode::Sell, policy, &prices);
            for pair in updates.windows(2) {
                prop_assert!(pair[1].state.current_stop >= pair[0].state.current_stop);
            }
        }

        #[test]
        fn prop_buy_stop_is_non_increasing(prices in price_strategy(), policy in policy_strategy()) {
            let updates = run(TradeMode::Buy, policy, &prices);
            for pair in updates.windows(2) {
                prop_assert!(pair[1].state.current_stop <= pair[0].state.current_stop);
            }
        }

        #[test]
        fn test_crossing_matches_ratcheted_stop(prices in price_strategy(), policy in policy_strategy(), sell in any::<bool>()) {
            let direction = if sell { TradeMode::Sell } else { TradeMode::Buy };
            let updates = run(direction, policy, &prices);
            for (price, update) in prices.iter().zip(updates.iter()).skip(1) {
                let stop = update.state.current_stop.unwrap();
                let against_new = match direction {
                    TradeMode::Sell => *price <= stop,
                    TradeMode::Buy => *price >= stop,
                };
                prop_assert_eq!(update.crossed, against_new);
            }
        }
    }
}
