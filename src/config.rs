//! Configuration for the trailing stop bot
//!
//! `Config` holds process-level settings from the environment (and `.env`).
//! `RunConfig` is one `run` invocation's strategy parameters, validated once
//! into typed values before the loop starts.

use crate::error::ConfigError;
use crate::services::coinbase::DEFAULT_API_URL;
use crate::services::retry::RetryConfig;
use crate::strategies::exit_ladder::{parse_ladder_spec, LadderEntry};
use crate::types::{PairKey, StopDistancePolicy, TradeMode};
use anyhow::Result;
use clap::Args;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database
    pub database_path: String,

    /// Whether running in paper trading mode
    pub paper_trading: bool,

    /// Coinbase Advanced Trade API
    pub coinbase_api_url: String,
    pub coinbase_api_key_name: Option<String>,
    pub coinbase_api_private_key: Option<String>,

    /// Discord webhook URL for fill and halt alerts (optional)
    pub discord_webhook_url: Option<String>,

    /// Cross-tick retry budget for order submission
    pub order_retry: RetryConfig,

    /// In-tick retries for price and balance requests
    pub feed_retry: RetryConfig,

    /// Fraction of the allocated quote share spent on a buy (leaves room for fees)
    pub buy_fee_buffer: Decimal,

    /// Starting balances for paper trading
    pub paper_balances: HashMap<String, Decimal>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "trailing_stop.db".to_string());

        let paper_trading = env::var("PAPER_TRADING")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(true); // Default to paper trading for safety

        let coinbase_api_url = env::var("COINBASE_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let coinbase_api_key_name = env::var("COINBASE_API_KEY_NAME").ok().filter(|s| !s.is_empty());
        let coinbase_api_private_key = env::var("COINBASE_API_PRIVATE_KEY").ok().filter(|s| !s.is_empty());

        let discord_webhook_url = env::var("DISCORD_WEBHOOK_URL").ok().filter(|s| !s.is_empty());

        let order_retry = RetryConfig {
            max_retries: env_parse("ORDER_MAX_RETRIES", 3),
            initial_delay_ms: env_parse("ORDER_RETRY_INITIAL_DELAY_MS", 5_000),
            max_delay_ms: env_parse("ORDER_RETRY_MAX_DELAY_MS", 60_000),
            backoff_factor: env_parse("ORDER_RETRY_BACKOFF", 2.0),
        };

        let feed_retry = RetryConfig {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 2_000,
            backoff_factor: 2.0,
        };

        let buy_fee_buffer = env::var("BUY_FEE_BUFFER")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(dec!(0.999));

        let paper_balances = parse_balances(
            &env::var("PAPER_BALANCES").unwrap_or_else(|_| "USD=1000".to_string()),
        )?;

        let config = Self {
            database_path,
            paper_trading,
            coinbase_api_url,
            coinbase_api_key_name,
            coinbase_api_private_key,
            discord_webhook_url,
            order_retry,
            feed_retry,
            buy_fee_buffer,
            paper_balances,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buy_fee_buffer <= Decimal::ZERO || self.buy_fee_buffer > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "BUY_FEE_BUFFER must be in (0, 1], got {}",
                self.buy_fee_buffer
            )));
        }
        if self.order_retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid("ORDER_RETRY_BACKOFF must be >= 1".to_string()));
        }
        if !self.paper_trading && (self.coinbase_api_key_name.is_none() || self.coinbase_api_private_key.is_none()) {
            return Err(ConfigError::Invalid(
                "live trading needs COINBASE_API_KEY_NAME and COINBASE_API_PRIVATE_KEY".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parse `USD=1000,BTC=0.5`
pub fn parse_balances(spec: &str) -> Result<HashMap<String, Decimal>, ConfigError> {
    let mut balances = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (currency, amount) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("PAPER_BALANCES entry '{}' is not CURRENCY=AMOUNT", entry)))?;
        let amount = Decimal::from_str(amount.trim())
            .ok()
            .filter(|a| *a >= Decimal::ZERO)
            .ok_or_else(|| ConfigError::Invalid(format!("PAPER_BALANCES amount in '{}'", entry)))?;
        balances.insert(currency.trim().to_uppercase(), amount);
    }
    Ok(balances)
}

/// Command-line arguments of `run`
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Market symbol, repeatable (e.g. BTC/USD); asked for when omitted
    #[arg(long = "symbol")]
    pub symbols: Vec<String>,

    /// Trading mode: buy or sell; asked for when omitted
    #[arg(long = "type")]
    pub trade_type: Option<String>,

    /// Percentage stop distance as a fraction (0.05 = 5%)
    #[arg(long, conflicts_with = "distance")]
    pub size: Option<Decimal>,

    /// Absolute stop distance in quote currency units
    #[arg(long)]
    pub distance: Option<Decimal>,

    /// Seconds between price checks
    #[arg(long, default_value_t = 5.0)]
    pub interval: f64,

    /// Number of pairs the quote balance is split between
    #[arg(long, default_value_t = 1)]
    pub split: u32,

    /// Sell the whole holding on a crossing, no threshold ladder
    #[arg(long, conflicts_with = "dca")]
    pub simple: bool,

    /// Threshold ladder as PRICE:AMOUNT pairs, absolute or +PERCENT%
    #[arg(long)]
    pub dca: Option<String>,

    /// Deposit reference price for a new buy round (default: current price)
    #[arg(long)]
    pub deposit_price: Option<Decimal>,
}

impl RunArgs {
    /// Whether a required choice was left out of the command line
    pub fn is_incomplete(&self) -> bool {
        self.trade_type.is_none() || self.symbols.is_empty() || (self.size.is_none() && self.distance.is_none())
    }
}

/// How a sell pair gets its thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderSetup {
    /// No ladder: sell the whole holding on a crossing
    Simple,
    /// +10/20/30/50% tiers of a quarter of the balance each
    Default,
    Custom(Vec<LadderEntry>),
}

/// Validated parameters of one `run`
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pairs: Vec<PairKey>,
    pub mode: TradeMode,
    pub policy: StopDistancePolicy,
    pub interval: Duration,
    pub split: u32,
    pub ladder: LadderSetup,
    pub deposit_price: Option<Decimal>,
}

impl TryFrom<&RunArgs> for RunConfig {
    type Error = ConfigError;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let trade_type = args
            .trade_type
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("--type is required".to_string()))?;
        let mode = TradeMode::from_str(trade_type)?;

        let mut pairs: Vec<PairKey> = Vec::new();
        for symbol in &args.symbols {
            let key = PairKey::new(symbol, mode)?;
            if !pairs.contains(&key) {
                pairs.push(key);
            }
        }
        if pairs.is_empty() {
            return Err(ConfigError::Invalid("at least one --symbol is required".to_string()));
        }

        let policy = match (args.size, args.distance) {
            (Some(fraction), None) => StopDistancePolicy::percentage(fraction)?,
            (None, Some(amount)) => StopDistancePolicy::absolute(amount)?,
            _ => {
                return Err(ConfigError::Invalid(
                    "exactly one of --size or --distance is required".to_string(),
                ))
            }
        };

        if !(args.interval.is_finite() && args.interval > 0.0) {
            return Err(ConfigError::Invalid(format!("--interval must be positive, got {}", args.interval)));
        }
        let interval = Duration::try_from_secs_f64(args.interval)
            .map_err(|_| ConfigError::Invalid(format!("--interval {} is out of range", args.interval)))?;

        if args.split == 0 {
            return Err(ConfigError::Invalid("--split must be at least 1".to_string()));
        }
        if mode == TradeMode::Buy && (args.split as usize) < pairs.len() {
            return Err(ConfigError::SplitTooSmall {
                split: args.split,
                symbols: pairs.len(),
            });
        }

        let ladder = match (&args.dca, args.simple) {
            (Some(spec), _) => LadderSetup::Custom(parse_ladder_spec(spec)?),
            (None, true) => LadderSetup::Simple,
            (None, false) => LadderSetup::Default,
        };
        if mode == TradeMode::Buy && matches!(ladder, LadderSetup::Custom(_)) {
            return Err(ConfigError::Invalid("--dca only applies to sell mode".to_string()));
        }

        if let Some(price) = args.deposit_price {
            if mode != TradeMode::Buy {
                return Err(ConfigError::Invalid("--deposit-price only applies to buy mode".to_string()));
            }
            if price <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!("--deposit-price must be positive, got {}", price)));
            }
        }

        Ok(Self {
            pairs,
            mode,
            policy,
            interval,
            split: args.split,
            ladder,
            deposit_price: args.deposit_price,
        })
    }
}

impl RunConfig {
    pub fn is_simple(&self) -> bool {
        self.ladder == LadderSetup::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            symbols: vec!["btc/usd".into()],
            trade_type: Some("sell".into()),
            size: Some(dec!(0.05)),
            distance: None,
            interval: 5.0,
            split: 1,
            simple: false,
            dca: None,
            deposit_price: None,
        }
    }

    #[test]
    fn test_default_sell_run() {
        let run = RunConfig::try_from(&args()).unwrap();
        assert_eq!(run.mode, TradeMode::Sell);
        assert_eq!(run.pairs[0].symbol, "BTC/USD");
        assert_eq!(run.policy, StopDistancePolicy::Percentage(dec!(0.05)));
        assert_eq!(run.ladder, LadderSetup::Default);
        assert_eq!(run.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_distance_policy_validation() {
        let mut a = args();
        a.size = Some(dec!(1.5));
        assert!(matches!(RunConfig::try_from(&a), Err(ConfigError::InvalidPercentage(_))));

        a.size = None;
        a.distance = Some(dec!(100));
        assert_eq!(RunConfig::try_from(&a).unwrap().policy, StopDistancePolicy::Absolute(dec!(100)));

        a.distance = None;
        assert!(RunConfig::try_from(&a).is_err());
    }

    #[test]
    fn test_split_must_cover_buy_symbols() {
        let mut a = args();
        a.trade_type = Some("buy".into());
        a.symbols = vec!["BTC/USD".into(), "ETH/USD".into()];
        let err = RunConfig::try_from(&a).unwrap_err();
        assert!(matches!(err, ConfigError::SplitTooSmall { split: 1, symbols: 2 }));

        a.split = 2;
        assert_eq!(RunConfig::try_from(&a).unwrap().pairs.len(), 2);
    }

    #[test]
    fn test_ladder_setup() {
        let mut a = args();
        a.simple = true;
        assert!(RunConfig::try_from(&a).unwrap().is_simple());

        a.simple = false;
        a.dca = Some("+10%:0.25,900:0.25".into());
        assert!(matches!(RunConfig::try_from(&a).unwrap().ladder, LadderSetup::Custom(ref e) if e.len() == 2));

        a.dca = Some("oops".into());
        assert!(matches!(RunConfig::try_from(&a), Err(ConfigError::InvalidLadderEntry { .. })));
    }

    #[test]
    fn test_bad_inputs() {
        let mut a = args();
        a.trade_type = Some("hold".into());
        assert!(matches!(RunConfig::try_from(&a), Err(ConfigError::InvalidTradeType(_))));

        let mut a = args();
        a.trade_type = None;
        assert!(RunConfig::try_from(&a).is_err());

        let mut a = args();
        a.symbols.clear();
        assert!(RunConfig::try_from(&a).is_err());

        let mut a = args();
        a.symbols = vec!["BTCUSD".into()];
        assert!(matches!(RunConfig::try_from(&a), Err(ConfigError::InvalidSymbol(_))));

        let mut a = args();
        a.interval = 0.0;
        assert!(RunConfig::try_from(&a).is_err());

        let mut a = args();
        a.interval = 1e300;
        assert!(matches!(RunConfig::try_from(&a), Err(ConfigError::Invalid(_))));

        let mut a = args();
        a.interval = 0.25;
        assert_eq!(RunConfig::try_from(&a).unwrap().interval, Duration::from_millis(250));

        let mut a = args();
        a.deposit_price = Some(dec!(1000));
        assert!(RunConfig::try_from(&a).is_err());
    }

    #[test]
    fn test_parse_balances() {
        let balances = parse_balances("usd=1000, BTC=0.5,,").unwrap();
        assert_eq!(balances["USD"], dec!(1000));
        assert_eq!(balances["BTC"], dec!(0.5));
        assert!(parse_balances("USD").is_err());
        assert!(parse_balances("USD=-1").is_err());
    }

    #[test]
    fn test_live_needs_credentials() {
        let config = Config {
            database_path: ":memory:".into(),
            paper_trading: false,
            coinbase_api_url: DEFAULT_API_URL.into(),
            coinbase_api_key_name: None,
            coinbase_api_private_key: None,
            discord_webhook_url: None,
            order_retry: RetryConfig::default(),
            feed_retry: RetryConfig::default(),
            buy_fee_buffer: dec!(0.999),
            paper_balances: HashMap::new(),
        };
        assert!(config.validate().is_err());
        assert!(Config { paper_trading: true, ..config.clone() }.validate().is_ok());
        assert!(Config { paper_trading: true, buy_fee_buffer: dec!(1.5), ..config }.validate().is_err());
    }
}
