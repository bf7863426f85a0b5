//! kalshi-micro: feed replay ingestion and microstructure analyses.
//!
//! Usage:
//!   kalshi-micro ingest recorded_feed.jsonl --markets KXNFLGAME-25NOV09BUFMIA-BUF,KXNFLGAME-25NOV09BUFMIA-MIA
//!   kalshi-micro slippage 'KXNFLGAME-25NOV09*'
//!   kalshi-micro flow KXNFLGAME-25NOV09BUFMIA-BUF
//!   kalshi-micro predictability KXNFLGAME-25NOV09BUFMIA-BUF
//!   kalshi-micro inspect
//!   kalshi-micro init-config kalshi_micro.toml

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use kalshi_microstructure::analytics::{
    analyze_pattern, analyze_predictability, analyze_volume_flow, recent_markets_by_date,
    write_report,
};
use kalshi_microstructure::book::OrderBookEngine;
use kalshi_microstructure::feed::{spawn_replay, Ingestor, RecordingControl};
use kalshi_microstructure::storage::TimeWindow;
use kalshi_microstructure::{AnalysisConfig, MarketStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kalshi-micro")]
#[command(about = "Kalshi order book reconstruction and microstructure analytics")]
struct Cli {
    /// SQLite database with trades and orderbook_snapshots
    #[arg(long, env = "DATABASE_PATH", default_value = "kalshi_data.db")]
    db: String,

    /// Root directory for JSON reports
    #[arg(long, env = "OUTPUT_DIR", default_value = "analysis")]
    output_dir: PathBuf,

    /// Analysis config (TOML); defaults to $KALSHI_MICRO_CONFIG or built-in values
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded feed (one JSON frame per line) into the database
    Ingest {
        file: PathBuf,

        /// Subscribed markets; empty tracks every market seen
        #[arg(long, value_delimiter = ',')]
        markets: Vec<String>,

        #[arg(long, default_value = "1024")]
        buffer: usize,
    },

    /// Slippage and markouts for a ticker or `*` pattern
    Slippage {
        pattern: String,
        #[arg(long)]
        start: Option<i64>,
        #[arg(long)]
        end: Option<i64>,
    },

    /// Cumulative signed volume with the linked market's inverted tape
    Flow {
        ticker: String,
        /// Linked market to use instead of the event-prefix lookup
        #[arg(long)]
        linked: Option<String>,
        #[arg(long)]
        start: Option<i64>,
        #[arg(long)]
        end: Option<i64>,
    },

    /// Order book imbalance vs. forward returns
    Predictability {
        ticker: String,
        #[arg(long)]
        start: Option<i64>,
        #[arg(long)]
        end: Option<i64>,
    },

    /// Table totals, tickers and time ranges
    Inspect,

    /// Markets traded in the last N days, grouped by date
    Recent {
        #[arg(long, default_value = "7")]
        days: i64,

        /// Also count markets that only have snapshots
        #[arg(long)]
        any_activity: bool,
    },

    /// Traded contracts per minute for a ticker
    Volume {
        ticker: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Write the effective analysis config as TOML
    InitConfig {
        #[arg(default_value = "kalshi_micro.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AnalysisConfig::from_env(),
    };

    match cli.command {
        Commands::Ingest { file, markets, buffer } => {
            run_ingest(&cli.db, file, markets, buffer, config).await?
        }
        Commands::Slippage { pattern, start, end } => {
            let store = MarketStore::open(&cli.db)?;
            let window = TimeWindow { start_ts: start, end_ts: end };
            match analyze_pattern(&store, &pattern, window, &config)? {
                Some(report) => {
                    println!(
                        "{}: {} trades across {} markets, mean slippage {:.3}c, paid ${:.2}",
                        report.name,
                        report.summary.trades,
                        report.tickers.len(),
                        report.summary.mean_slippage,
                        report.summary.total_slippage_paid_dollars,
                    );
                    for (h, (plain, weighted)) in report
                        .markouts
                        .horizons
                        .iter()
                        .zip(report.markouts.by_trade.iter().zip(&report.markouts.by_volume))
                    {
                        println!("  markout {:>4}s: {:>8.3} by trade, {:>8.3} by volume", h, plain, weighted);
                    }
                    write_report(&cli.output_dir, "slippage", &report.name, &report)?;
                }
                None => println!("No analysable data for pattern {}", pattern),
            }
        }
        Commands::Flow { ticker, linked, start, end } => {
            let store = MarketStore::open(&cli.db)?;
            let window = TimeWindow { start_ts: start, end_ts: end };
            match analyze_volume_flow(
                &store,
                &ticker,
                linked.as_deref(),
                window,
                config.net_flow_bucket_secs,
            )? {
                Some(report) => {
                    println!(
                        "{} (+{} inverted): {} trades, final cumulative signed volume {}",
                        report.base_ticker,
                        report
                            .linked
                            .as_ref()
                            .map(|l| l.ticker.as_str())
                            .unwrap_or("no linked market"),
                        report.base_trades + report.linked_trades,
                        report.final_cumulative,
                    );
                    write_report(&cli.output_dir, "volume_flow", &ticker, &report)?;
                }
                None => println!("No trades found for {}", ticker),
            }
        }
        Commands::Predictability { ticker, start, end } => {
            let store = MarketStore::open(&cli.db)?;
            let window = TimeWindow { start_ts: start, end_ts: end };
            match analyze_predictability(&store, &ticker, window, &config)? {
                Some(report) => {
                    for (h, corr) in report.correlation_table() {
                        match corr {
                            Some(c) => println!("  horizon {:>4}s: correlation {:+.4}", h, c),
                            None => println!("  horizon {:>4}s: n/a", h),
                        }
                    }
                    write_report(&cli.output_dir, "imbalance", &ticker, &report)?;
                }
                None => println!("No usable snapshots for {}", ticker),
            }
        }
        Commands::Inspect => {
            let store = MarketStore::open(&cli.db)?;
            let summary = store.summary()?;
            for (name, table) in [("trades", &summary.trades), ("orderbook_snapshots", &summary.snapshots)] {
                println!("=== {} ===", name);
                println!("  rows: {}", table.rows);
                println!("  distinct tickers: {}", table.distinct_tickers);
                println!("  time range: {} .. {}", fmt_ts(table.min_ts), fmt_ts(table.max_ts));
                for (ticker, count) in &table.per_ticker {
                    println!("    {:<40} {}", ticker, count);
                }
            }
        }
        Commands::Recent { days, any_activity } => {
            let store = MarketStore::open(&cli.db)?;
            let since = (Utc::now() - Duration::days(days)).timestamp();
            if any_activity {
                let tickers = store.active_tickers(since)?;
                println!("{} active markets since {}", tickers.len(), fmt_ts(Some(since)));
                for t in tickers {
                    println!("- {}", t);
                }
            } else {
                let groups = recent_markets_by_date(store.recent_markets(since)?);
                if groups.is_empty() {
                    println!("No markets traded in the last {} days", days);
                }
                for (date, markets) in groups {
                    println!("{}:", date);
                    for m in markets {
                        println!("- {}", m.ticker);
                    }
                    println!();
                }
            }
        }
        Commands::Volume { ticker, limit } => {
            let store = MarketStore::open(&cli.db)?;
            for (minute, volume) in store.minute_volume(&ticker, limit)? {
                println!("{}  {}", minute, volume);
            }
        }
        Commands::InitConfig { path } => {
            config
                .save(&path)
                .with_context(|| format!("Failed to write config {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

async fn run_ingest(
    db: &str,
    file: PathBuf,
    markets: Vec<String>,
    buffer: usize,
    config: AnalysisConfig,
) -> Result<()> {
    let store = Arc::new(MarketStore::open(db)?);
    let engine = OrderBookEngine::new(store.clone());
    let mut ingestor = Ingestor::new(engine, store.clone(), markets, config);
    let mut control = RecordingControl::default();

    info!(file = %file.display(), "Replaying recorded feed");
    let (rx, replay) = spawn_replay(file, buffer);
    let stats = ingestor.run(rx, &mut control).await?;
    let lines = replay.await.context("Replay task failed")??;

    for issue in ingestor.engine().quality_issues() {
        warn!(issue = %issue, "Data quality");
    }
    info!(
        lines,
        unsubscribes = control.commands.len(),
        closed = control.closed,
        storage = %store.stats().summary(),
        "Ingest complete"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn fmt_ts(ts: Option<i64>) -> String {
    ts.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kalshi_microstructure=info,kalshi_micro=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
