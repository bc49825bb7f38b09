//! Trailing Stop Bot CLI
//!
//! Runs trailing-stop sell ladders and deposit-range buys against Coinbase,
//! or a paper account fed by live Coinbase prices.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{self, IsTerminal};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use trailing_stop_bot::config::{RunArgs, RunConfig};
use trailing_stop_bot::prompt::{complete_run_args, Prompter};
use trailing_stop_bot::services::exchange::sellable_assets;
use trailing_stop_bot::services::{CoinbaseExchange, Exchange, Metrics, PaperExchange};
use trailing_stop_bot::strategies::ModeState;
use trailing_stop_bot::types::{PairKey, TradeMode};
use trailing_stop_bot::{Config, Database, PollLoop};

#[derive(Parser)]
#[command(name = "trailing-stop-bot")]
#[command(about = "Trailing stop bot with threshold exit ladders and deposit-range buys")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trailing stop loop
    Run(RunArgs),

    /// Show persisted state for a pair
    Status {
        #[arg(long)]
        symbol: String,

        /// buy or sell
        #[arg(long = "type")]
        trade_type: String,
    },

    /// List account balances and the assets available to sell
    Balances,

    /// Clear a stale instance lock left by a crashed run
    ResetLock {
        #[arg(long)]
        symbol: String,

        #[arg(long = "type")]
        trade_type: String,
    },

    /// Clear a halted pair so the next run trades it again
    Resume {
        #[arg(long)]
        symbol: String,

        #[arg(long = "type")]
        trade_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    match cli.command {
        Commands::Run(args) => run_bot(&config, args).await?,
        Commands::Balances => show_balances(&config).await?,
        Commands::Status { symbol, trade_type } => show_status(&config, &pair_key(&symbol, &trade_type)?).await?,
        Commands::ResetLock { symbol, trade_type } => reset_lock(&config, &pair_key(&symbol, &trade_type)?).await?,
        Commands::Resume { symbol, trade_type } => resume_pair(&config, &pair_key(&symbol, &trade_type)?).await?,
    }

    Ok(())
}

fn pair_key(symbol: &str, trade_type: &str) -> Result<PairKey> {
    let mode = TradeMode::from_str(trade_type)?;
    Ok(PairKey::new(symbol, mode)?)
}

fn build_exchange(config: &Config) -> Result<Arc<dyn Exchange>> {
    let live = CoinbaseExchange::public(&config.coinbase_api_url)?;
    if config.paper_trading {
        return Ok(Arc::new(PaperExchange::new(Arc::new(live), config.paper_balances.clone())));
    }

    let key_name = config
        .coinbase_api_key_name
        .as_deref()
        .context("COINBASE_API_KEY_NAME is required for live trading")?;
    let private_key = config
        .coinbase_api_private_key
        .as_deref()
        .context("COINBASE_API_PRIVATE_KEY is required for live trading")?;
    Ok(Arc::new(CoinbaseExchange::new(&config.coinbase_api_url, key_name, private_key)?))
}

async fn run_bot(config: &Config, mut args: RunArgs) -> Result<()> {
    let exchange = build_exchange(config)?;

    if args.is_incomplete() {
        if !io::stdin().is_terminal() {
            bail!("--type, --symbol and --size or --distance are required when not running interactively");
        }
        let mut prompter = Prompter::new(io::stdin().lock(), io::stdout());
        complete_run_args(&mut args, &mut prompter, exchange.as_ref()).await?;
    }
    let run = RunConfig::try_from(&args)?;

    println!("\n{}", "=".repeat(70));
    println!("  TRAILING STOP BOT");
    println!(
        "  Mode: {} | Stop: {} | Interval: {:?} | {}",
        run.mode,
        run.policy,
        run.interval,
        if config.paper_trading {
            "PAPER".yellow().bold()
        } else {
            "LIVE".red().bold()
        }
    );
    println!(
        "  Pairs: {}",
        run.pairs.iter().map(|k| k.symbol.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("{}\n", "=".repeat(70));

    let db = Arc::new(
        Database::new(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path))?,
    );

    let mut poll = PollLoop::new(run, config, exchange, db, Metrics::new());
    poll.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, finishing current tick...");
        let _ = shutdown_tx.send(true);
    });

    poll.run(shutdown_rx).await
}

async fn show_status(config: &Config, key: &PairKey) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    let simple = key.mode == TradeMode::Sell && !db.has_thresholds(&key.symbol).await?;

    println!("\n{}", "=".repeat(70));
    println!("  STATUS {}", key.to_string().bold());
    println!("{}\n", "=".repeat(70));

    match db.lock_info(key).await? {
        Some(lock) if lock.running => println!(
            "Lock:      {} (pid {:?}, since {:?})",
            "RUNNING".yellow(),
            lock.pid,
            lock.started_at
        ),
        _ => println!("Lock:      free"),
    }

    let state = match db.load_pair_state(key, simple).await {
        Ok(state) => state,
        Err(e) => {
            warn!("No usable state for {}: {}", key, e);
            println!("No persisted state.");
            return Ok(());
        }
    };

    let status = match (&state.halted, state.completed) {
        (Some(reason), _) => format!("HALTED: {}", reason).red().bold(),
        (None, true) => "completed".green(),
        (None, false) => "active".normal(),
    };
    println!("Status:    {}", status);
    println!(
        "Stop:      {} (armed: {})",
        state.stop.current_stop.map(|s| s.to_string()).unwrap_or_else(|| "unset".into()),
        state.stop.armed
    );

    match &state.mode {
        ModeState::Sell { ladder: None } => println!("Ladder:    simple (whole balance on crossing)"),
        ModeState::Sell { ladder: Some(ladder) } => {
            println!("Ladder:    sold {} | hopper {}", ladder.sold(), ladder.hopper());
            for t in ladder.thresholds() {
                let mark = if t.released { "released".green() } else { "waiting".normal() };
                println!(
                    "  {:>14} -> {:<14} {}{}",
                    t.price,
                    t.release_amount,
                    mark,
                    t.linked_order_id.as_deref().map(|id| format!(" ({})", id)).unwrap_or_default()
                );
            }
        }
        ModeState::Buy { range } => println!(
            "Range:     deposit {} [{} .. {}]{}",
            range.deposit_price,
            range.lower_bound,
            range.upper_bound,
            if range.completed { " completed" } else { "" }
        ),
    }

    let stats = &state.stats;
    println!("\nStatistics:");
    println!("  Trades:       {}", stats.trades_executed);
    println!("  Base volume:  {}", stats.base_volume);
    println!("  Quote volume: {}", stats.quote_volume);
    if let Some(rate) = stats.win_rate() {
        println!("  Win rate:     {:.1}% ({} of {} buys)", rate, stats.win_count, stats.buy_count);
    }

    if let Some(pending) = &state.pending {
        println!("\n{}", "Pending order:".yellow());
        println!(
            "  {} {} (client id {}, attempts {}){}",
            pending.side,
            pending.size,
            pending.client_order_id,
            pending.attempts,
            pending.last_error.as_deref().map(|e| format!(", last error: {}", e)).unwrap_or_default()
        );
    }

    let trades = db.recent_trades(key, 10).await?;
    if !trades.is_empty() {
        println!("\nRecent Trades ({}):", trades.len());
        for trade in &trades {
            println!(
                "  {} {} {} @ {} ({})",
                trade.filled_at.format("%Y-%m-%d %H:%M:%S"),
                trade.side,
                trade.size,
                trade.price,
                trade.order_id
            );
        }
    }

    Ok(())
}

async fn show_balances(config: &Config) -> Result<()> {
    let exchange = build_exchange(config)?;
    let balances = exchange.balances().await?;
    let sellable = sellable_assets(exchange.as_ref()).await?;

    println!("\n{}", "=".repeat(70));
    println!(
        "  BALANCES {}",
        if config.paper_trading {
            "PAPER".yellow().bold()
        } else {
            "LIVE".red().bold()
        }
    );
    println!("{}\n", "=".repeat(70));

    if balances.is_empty() {
        println!("No non-zero balances.");
        return Ok(());
    }
    for (currency, amount) in &balances {
        let sellable = sellable.iter().any(|(c, _)| c == currency);
        let line = format!("  {:<8} {}", currency, amount);
        if sellable {
            println!("{}", line.green());
        } else {
            println!("{}", line);
        }
    }

    if sellable.is_empty() {
        println!("\nNothing to sell.");
    } else {
        println!(
            "\nSellable: {}",
            sellable.iter().map(|(c, _)| format!("{}/USD", c)).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

async fn reset_lock(config: &Config, key: &PairKey) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    if db.reset_lock(key).await? {
        println!("{} lock cleared for {}", "OK".green(), key);
    } else {
        println!("No lock held for {}", key);
    }
    Ok(())
}

async fn resume_pair(config: &Config, key: &PairKey) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    if db.clear_halt(key).await? {
        println!("{} {} resumed; it trades again on the next run", "OK".green(), key);
    } else {
        println!("{} is not halted", key);
    }
    Ok(())
}
