//! Exit ladder (sell mode)
//!
//! Inventory is released in fixed slices as price climbs through ascending
//! thresholds. Released-but-unsold quantity sits in the hopper until the
//! trailing stop is crossed, at which point the whole hopper is sold.
//!
//! Ladder specs use the `PRICE:AMOUNT,...` format, where PRICE is absolute
//! (`0.30`) or relative to the seed price (`+10%`).

use crate::error::ConfigError;
use crate::types::ExitThreshold;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

/// Price of a ladder entry before it is seeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderPrice {
    Absolute(Decimal),
    /// Percent above the price at seed time, e.g. 10 for `+10%`
    RelativePercent(Decimal),
}

/// One parsed `PRICE:AMOUNT` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderEntry {
    pub price: LadderPrice,
    pub amount: Decimal,
}

impl LadderEntry {
    pub fn resolve(&self, reference_price: Decimal) -> Decimal {
        match self.price {
            LadderPrice::Absolute(price) => price,
            LadderPrice::RelativePercent(pct) => {
                reference_price * (Decimal::ONE + pct / Decimal::ONE_HUNDRED)
            }
        }
    }
}

/// Parse a comma separated ladder spec. Empty entries are skipped.
pub fn parse_ladder_spec(spec: &str) -> Result<Vec<LadderEntry>, ConfigError> {
    let mut entries = Vec::new();

    for (i, raw) in spec.split(',').enumerate() {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }

        let invalid = |reason: &str| ConfigError::InvalidLadderEntry {
            index: i + 1,
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (price_str, amount_str) = entry
            .split_once(':')
            .ok_or_else(|| invalid("expected PRICE:AMOUNT or +PERCENT%:AMOUNT"))?;
        let price_str = price_str.trim();

        let amount = Decimal::from_str(amount_str.trim()).map_err(|_| invalid("amount is not a number"))?;
        if amount <= Decimal::ZERO {
            return Err(invalid("amount must be positive"));
        }

        let price = if let Some(pct) = price_str.strip_prefix('+').and_then(|p| p.strip_suffix('%')) {
            let pct = Decimal::from_str(pct.trim()).map_err(|_| invalid("percentage is not a number"))?;
            LadderPrice::RelativePercent(pct)
        } else {
            let price = Decimal::from_str(price_str).map_err(|_| invalid("price is not a number"))?;
            if price <= Decimal::ZERO {
                return Err(invalid("price must be positive"));
            }
            LadderPrice::Absolute(price)
        };

        entries.push(LadderEntry { price, amount });
    }

    if entries.is_empty() {
        return Err(ConfigError::Invalid("ladder spec has no entries".to_string()));
    }

    Ok(entries)
}

/// Four tiers at +10/+20/+30/+50%, each releasing a quarter of the balance
pub fn default_ladder(balance: Decimal) -> Vec<LadderEntry> {
    let portion = balance / dec!(4);
    [dec!(10), dec!(20), dec!(30), dec!(50)]
        .into_iter()
        .map(|pct| LadderEntry {
            price: LadderPrice::RelativePercent(pct),
            amount: portion,
        })
        .collect()
}

/// Resolve entries against a reference price into sorted (price, amount) rows
pub fn resolve_entries(entries: &[LadderEntry], reference_price: Decimal) -> Vec<(Decimal, Decimal)> {
    let mut rows: Vec<_> = entries
        .iter()
        .map(|e| (e.resolve(reference_price), e.amount))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

/// Threshold set plus hopper bookkeeping for one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitLadder {
    thresholds: Vec<ExitThreshold>,
    /// Base amount already sold out of released inventory
    sold: Decimal,
}

impl ExitLadder {
    /// Validate persisted rows and order them by price
    pub fn new(mut thresholds: Vec<ExitThreshold>, sold: Decimal) -> Result<Self, ConfigError> {
        for t in &thresholds {
            if t.price <= Decimal::ZERO {
                return Err(ConfigError::InvalidThreshold {
                    id: t.id,
                    reason: format!("price {} must be positive", t.price),
                });
            }
            if t.release_amount < Decimal::ZERO {
                return Err(ConfigError::InvalidThreshold {
                    id: t.id,
                    reason: format!("release amount {} is negative", t.release_amount),
                });
            }
        }
        if sold < Decimal::ZERO {
            return Err(ConfigError::Invalid(format!("sold amount {} is negative", sold)));
        }

        thresholds.sort_by(|a, b| a.price.cmp(&b.price).then(a.id.cmp(&b.id)));
        Ok(Self { thresholds, sold })
    }

    pub fn thresholds(&self) -> &[ExitThreshold] {
        &self.thresholds
    }

    pub fn sold(&self) -> Decimal {
        self.sold
    }

    pub fn released_total(&self) -> Decimal {
        self.thresholds
            .iter()
            .filter(|t| t.released)
            .map(|t| t.release_amount)
            .sum()
    }

    /// Released but not yet sold
    pub fn hopper(&self) -> Decimal {
        (self.released_total() - self.sold).max(Decimal::ZERO)
    }

    /// Release every unreleased threshold at or below the price
    pub fn on_price(&mut self, price: Decimal) -> Vec<ExitThreshold> {
        let mut newly_released = Vec::new();
        for threshold in self.thresholds.iter_mut() {
            if threshold.price > price {
                break;
            }
            if !threshold.released {
                threshold.released = true;
                newly_released.push(threshold.clone());
            }
        }
        newly_released
    }

    /// Sell amount for a stop crossing: the hopper, capped at what is held
    pub fn on_stop_crossing(&self, held: Decimal) -> Option<Decimal> {
        let amount = self.hopper().min(held);
        (amount > Decimal::ZERO).then_some(amount)
    }

    /// Book a filled sale against the hopper and link it to released rows
    pub fn record_sale(&mut self, amount: Decimal, order_id: &str) {
        self.sold += amount;
        for threshold in self.thresholds.iter_mut() {
            if threshold.released && threshold.linked_order_id.is_none() {
                threshold.linked_order_id = Some(order_id.to_string());
            }
        }
    }

    /// Every threshold released and the hopper emptied
    pub fn is_exhausted(&self) -> bool {
        self.thresholds.iter().all(|t| t.released) && self.hopper().is_zero()
    }
}
