//! Interactive setup
//!
//! Fills in whatever `run` was not told on the command line: trade type,
//! symbol, sell ladder and stop distance. Sell symbols are picked from the
//! account's non-cash balances. Invalid answers are asked again.

use crate::config::RunArgs;
use crate::services::exchange::{sellable_assets, Exchange};
use crate::strategies::exit_ladder::parse_ladder_spec;
use crate::types::{PairKey, TradeMode};
use anyhow::{bail, Result};
use rust_decimal::Decimal;
use std::io::{BufRead, Write};
use std::str::FromStr;

/// Stop distance as it is given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceAnswer {
    /// Fraction of the price (`--size`)
    Percentage(Decimal),
    /// Quote currency units (`--distance`)
    Absolute(Decimal),
}

/// Sell ladder choice as it is given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderAnswer {
    Simple,
    Default,
    Custom(String),
}

pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        write!(self.output, "{}", question)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            bail!("input closed before setup finished");
        }
        Ok(line.trim().to_string())
    }

    fn say(&mut self, message: &str) -> Result<()> {
        writeln!(self.output, "{}", message)?;
        Ok(())
    }

    pub fn trade_type(&mut self) -> Result<TradeMode> {
        loop {
            match self.ask("Trade type (1 = buy, 2 = sell): ")?.as_str() {
                "1" => return Ok(TradeMode::Buy),
                "2" => return Ok(TradeMode::Sell),
                _ => self.say("Enter 1 or 2.")?,
            }
        }
    }

    pub fn buy_symbol(&mut self) -> Result<String> {
        loop {
            let symbol = self.ask("Symbol to buy (e.g. BTC/USD): ")?.to_uppercase();
            match PairKey::new(&symbol, TradeMode::Buy) {
                Ok(key) => return Ok(key.symbol),
                Err(e) => self.say(&e.to_string())?,
            }
        }
    }

    /// Pick from the listed holdings, by number or currency. Always quoted in USD.
    pub fn sell_symbol(&mut self, sellable: &[(String, Decimal)]) -> Result<String> {
        if sellable.is_empty() {
            bail!("no sellable balances on the account");
        }

        self.say("Sellable balances:")?;
        for (i, (currency, amount)) in sellable.iter().enumerate() {
            self.say(&format!("  {}. {} ({})", i + 1, currency, amount))?;
        }

        loop {
            let answer = self.ask("Asset to sell (number or currency): ")?.to_uppercase();
            let picked = match answer.parse::<usize>() {
                Ok(n) if n >= 1 => sellable.get(n - 1),
                Ok(_) => None,
                Err(_) => sellable.iter().find(|(currency, _)| *currency == answer),
            };
            match picked {
                Some((currency, _)) => return Ok(format!("{}/USD", currency)),
                None => self.say("Not one of the listed assets.")?,
            }
        }
    }

    pub fn ladder(&mut self) -> Result<LadderAnswer> {
        loop {
            match self.ask("Sell mode (1 = simple, 2 = threshold ladder): ")?.as_str() {
                "1" => return Ok(LadderAnswer::Simple),
                "2" => break,
                _ => self.say("Enter 1 or 2.")?,
            }
        }

        loop {
            match self.ask("Ladder (1 = default +10/20/30/50%, 2 = custom): ")?.as_str() {
                "1" => return Ok(LadderAnswer::Default),
                "2" => break,
                _ => self.say("Enter 1 or 2.")?,
            }
        }

        loop {
            let spec = self.ask("Thresholds as PRICE:AMOUNT or +PERCENT%:AMOUNT, comma separated: ")?;
            match parse_ladder_spec(&spec) {
                Ok(_) => return Ok(LadderAnswer::Custom(spec)),
                Err(e) => self.say(&e.to_string())?,
            }
        }
    }

    pub fn stop_distance(&mut self) -> Result<DistanceAnswer> {
        let percentage = loop {
            match self.ask("Stop distance (1 = percentage, 2 = absolute): ")?.as_str() {
                "1" => break true,
                "2" => break false,
                _ => self.say("Enter 1 or 2.")?,
            }
        };

        let question = if percentage {
            "Distance as a fraction of price (0.05 = 5%): "
        } else {
            "Distance in quote currency: "
        };

        loop {
            let value = match Decimal::from_str(&self.ask(question)?) {
                Ok(v) if v > Decimal::ZERO => v,
                _ => {
                    self.say("Enter a number greater than 0.")?;
                    continue;
                }
            };

            if !percentage {
                return Ok(DistanceAnswer::Absolute(value));
            }
            if value < Decimal::ONE {
                return Ok(DistanceAnswer::Percentage(value));
            }
            let confirm = self.ask(&format!("{} is {}% of the price. Use it? (y/n): ", value, value * Decimal::ONE_HUNDRED))?;
            if confirm.eq_ignore_ascii_case("y") {
                return Ok(DistanceAnswer::Percentage(value));
            }
        }
    }
}

/// Ask for every choice missing from `args`, leaving given ones untouched
pub async fn complete_run_args<R: BufRead, W: Write>(
    args: &mut RunArgs,
    prompter: &mut Prompter<R, W>,
    exchange: &dyn Exchange,
) -> Result<()> {
    let mode = match args.trade_type.as_deref() {
        Some(given) => TradeMode::from_str(given)?,
        None => {
            let mode = prompter.trade_type()?;
            args.trade_type = Some(mode.to_string());
            mode
        }
    };

    let ask_ladder = mode == TradeMode::Sell && !args.simple && args.dca.is_none();

    if args.symbols.is_empty() {
        let symbol = match mode {
            TradeMode::Buy => prompter.buy_symbol()?,
            TradeMode::Sell => prompter.sell_symbol(&sellable_assets(exchange).await?)?,
        };
        args.symbols.push(symbol);
    }

    if ask_ladder {
        match prompter.ladder()? {
            LadderAnswer::Simple => args.simple = true,
            LadderAnswer::Default => {}
            LadderAnswer::Custom(spec) => args.dca = Some(spec),
        }
    }

    if args.size.is_none() && args.distance.is_none() {
        match prompter.stop_distance()? {
            DistanceAnswer::Percentage(v) => args.size = Some(v),
            DistanceAnswer::Absolute(v) => args.distance = Some(v),
        }
    }

    Ok(())
}
