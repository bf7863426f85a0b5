//! Execution slippage and post-trade markouts.
//!
//! Prices are YES cents. Side is inferred from execution price vs. mid:
//! above mid is a buy (+1), below is a sell (-1), at mid is ambiguous (0).

use crate::analytics::align::{align_trades, series_len, AlignedRecord, Alignment, MidSeries};
use crate::analytics::trades::TradeRecord;
use crate::book::Contracts;
use crate::config::AnalysisConfig;
use crate::error::MicroError;
use crate::storage::{MarketStore, TimeWindow};
use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use std::collections::BTreeMap;
use tracing::{info, warn};

const SECS_PER_HOUR: i64 = 3_600;

// =============================================================================
// PER-TRADE METRICS
// =============================================================================

pub fn infer_side(price: f64, mid: f64) -> i8 {
    if price > mid {
        1
    } else if price < mid {
        -1
    } else {
        0
    }
}

/// Spread-crossing cost; non-negative for side +/-1.
pub fn slippage(price: f64, mid: f64, side: i8) -> f64 {
    (price - mid) * side as f64
}

/// Taker P&L after the horizon; positive means the taker gained.
pub fn markout(price: f64, future_mid: f64, side: i8) -> f64 {
    match side {
        1 => future_mid - price,
        -1 => price - future_mid,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExecution {
    pub timestamp: i64,
    pub ticker: String,
    pub price: f64,
    pub count: Contracts,
    pub mid: f64,
    pub side: i8,
    pub slippage: f64,
    pub slippage_paid: f64,
    /// Parallel to the alignment horizons.
    pub markouts: Vec<f64>,
}

impl TradeExecution {
    pub fn from_aligned(record: &AlignedRecord) -> Self {
        let side = infer_side(record.price, record.mid);
        let slip = slippage(record.price, record.mid, side);
        Self {
            timestamp: record.timestamp,
            ticker: record.ticker.clone(),
            price: record.price,
            count: record.count,
            mid: record.mid,
            side,
            slippage: slip,
            slippage_paid: slip * record.count as f64,
            markouts: record
                .future_mids
                .iter()
                .map(|&fm| markout(record.price, fm, side))
                .collect(),
        }
    }
}

pub fn evaluate(alignment: &Alignment) -> Vec<TradeExecution> {
    alignment
        .records
        .iter()
        .map(TradeExecution::from_aligned)
        .collect()
}

// =============================================================================
// AGGREGATES
// =============================================================================

/// Mean markout per horizon, plain and count-weighted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkoutCurve {
    pub horizons: Vec<i64>,
    pub by_trade: Vec<f64>,
    pub by_volume: Vec<f64>,
    pub trades: usize,
    pub volume: Contracts,
}

/// Count-weighted mean; 0 when the total count is 0.
pub fn volume_weighted_mean(values: &[f64], counts: &[Contracts]) -> f64 {
    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    if total == 0.0 {
        return 0.0;
    }
    values
        .iter()
        .zip(counts)
        .map(|(v, &c)| v * c as f64)
        .sum::<f64>()
        / total
}

pub fn markout_curve(execs: &[&TradeExecution], horizons: &[i64]) -> MarkoutCurve {
    let counts: Vec<Contracts> = execs.iter().map(|e| e.count).collect();
    let mut by_trade = Vec::with_capacity(horizons.len());
    let mut by_volume = Vec::with_capacity(horizons.len());

    for i in 0..horizons.len() {
        let values: Vec<f64> = execs.iter().map(|e| e.markouts[i]).collect();
        by_trade.push(if values.is_empty() { 0.0 } else { values.iter().mean() });
        by_volume.push(volume_weighted_mean(&values, &counts));
    }

    MarkoutCurve {
        horizons: horizons.to_vec(),
        by_trade,
        by_volume,
        trades: execs.len(),
        volume: counts.iter().sum(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyMarkouts {
    pub hour_start: i64,
    pub curve: MarkoutCurve,
}

fn hour_of(ts: i64) -> i64 {
    ts.saturating_sub(ts.rem_euclid(SECS_PER_HOUR))
}

/// Markout curves per UTC hour; hours with fewer than `min_trades` trades
/// are skipped.
pub fn hourly_markouts(
    execs: &[TradeExecution],
    horizons: &[i64],
    min_trades: usize,
) -> Vec<HourlyMarkouts> {
    let mut by_hour: BTreeMap<i64, Vec<&TradeExecution>> = BTreeMap::new();
    for e in execs {
        by_hour.entry(hour_of(e.timestamp)).or_default().push(e);
    }

    by_hour
        .into_iter()
        .filter(|(_, group)| group.len() >= min_trades)
        .map(|(hour_start, group)| HourlyMarkouts {
            hour_start,
            curve: markout_curve(&group, horizons),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlySlippage {
    pub hour_start: i64,
    /// Sum of slippage paid, in dollars.
    pub slippage_paid_dollars: f64,
}

/// Slippage paid per UTC hour, contiguous from the first hour to the last.
pub fn hourly_slippage_paid(execs: &[TradeExecution]) -> Vec<HourlySlippage> {
    let (Some(first), Some(last)) = (
        execs.iter().map(|e| hour_of(e.timestamp)).min(),
        execs.iter().map(|e| hour_of(e.timestamp)).max(),
    ) else {
        return Vec::new();
    };

    let Some(n) = series_len(first, last, SECS_PER_HOUR) else {
        return Vec::new();
    };
    let mut cents = vec![0.0f64; n];
    for e in execs {
        let idx = ((hour_of(e.timestamp) - first) / SECS_PER_HOUR) as usize;
        cents[idx] += e.slippage_paid;
    }

    cents
        .into_iter()
        .enumerate()
        .map(|(i, c)| HourlySlippage {
            hour_start: first + i as i64 * SECS_PER_HOUR,
            slippage_paid_dollars: c / 100.0,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlippageSummary {
    pub trades: usize,
    pub volume: Contracts,
    pub buys: usize,
    pub sells: usize,
    pub ambiguous: usize,
    pub mean_slippage: f64,
    pub median_slippage: f64,
    pub total_slippage_paid_dollars: f64,
}

pub fn summarize(execs: &[TradeExecution]) -> SlippageSummary {
    if execs.is_empty() {
        return SlippageSummary::default();
    }
    let slippages: Vec<f64> = execs.iter().map(|e| e.slippage).collect();
    SlippageSummary {
        trades: execs.len(),
        volume: execs.iter().map(|e| e.count).sum(),
        buys: execs.iter().filter(|e| e.side == 1).count(),
        sells: execs.iter().filter(|e| e.side == -1).count(),
        ambiguous: execs.iter().filter(|e| e.side == 0).count(),
        mean_slippage: slippages.iter().mean(),
        median_slippage: Data::new(slippages).median(),
        total_slippage_paid_dollars: execs.iter().map(|e| e.slippage_paid).sum::<f64>() / 100.0,
    }
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageReport {
    /// Output name: the ticker, or the pattern with `*` as `_COMBINED`.
    pub name: String,
    pub tickers: Vec<String>,
    /// Tickers skipped for lack of trades or snapshots.
    pub skipped_tickers: Vec<String>,
    pub horizons: Vec<i64>,
    pub excluded_no_snapshot: usize,
    pub excluded_no_price: usize,
    pub summary: SlippageSummary,
    pub slippage_distribution: Vec<f64>,
    pub markouts: MarkoutCurve,
    pub hourly_markouts: Vec<HourlyMarkouts>,
    pub hourly_slippage: Vec<HourlySlippage>,
    pub executions: Vec<TradeExecution>,
}

/// Report name for a ticker or wildcard pattern.
pub fn output_name(pattern: &str) -> String {
    pattern.replace('*', "_COMBINED")
}

pub fn build_report(
    name: &str,
    tickers: Vec<String>,
    skipped_tickers: Vec<String>,
    alignment: &Alignment,
    config: &AnalysisConfig,
) -> SlippageReport {
    let executions = evaluate(alignment);
    let all: Vec<&TradeExecution> = executions.iter().collect();

    SlippageReport {
        name: name.to_string(),
        tickers,
        skipped_tickers,
        horizons: alignment.horizons.clone(),
        excluded_no_snapshot: alignment.excluded_no_snapshot,
        excluded_no_price: alignment.excluded_no_price,
        summary: summarize(&executions),
        slippage_distribution: executions.iter().map(|e| e.slippage).collect(),
        markouts: markout_curve(&all, &alignment.horizons),
        hourly_markouts: hourly_markouts(&executions, &alignment.horizons, config.min_trades_per_hour),
        hourly_slippage: hourly_slippage_paid(&executions),
        executions,
    }
}

/// Align one market's trades against its snapshot history.
///
/// Only trades are bounded by `window`; snapshots reach back to the book in
/// force at `start_ts` and forward by the longest horizon past `end_ts`.
/// `None` when the market has no trades or no snapshots.
pub fn align_market(
    store: &MarketStore,
    ticker: &str,
    window: TimeWindow,
    horizons: &[i64],
) -> Result<Option<Alignment>> {
    let trades: Vec<TradeRecord> = store
        .load_trades(ticker, window)?
        .iter()
        .map(TradeRecord::from_row)
        .collect();
    let lookahead = horizons.iter().copied().max().unwrap_or(0);
    let snapshot_rows = store.snapshot_history(ticker, window, lookahead)?;

    if trades.is_empty() || snapshot_rows.is_empty() {
        return Ok(None);
    }

    let (mids, skipped) = MidSeries::from_snapshot_rows(&snapshot_rows);
    if skipped > 0 {
        warn!(ticker = %ticker, skipped, "Skipped undecodable snapshots");
    }
    Ok(Some(align_trades(&trades, &mids, horizons)))
}

/// Slippage study over every ticker matching `pattern`.
///
/// Markets are aligned in parallel and combined. `None` when no ticker
/// matches or none has both trades and snapshots.
pub fn analyze_pattern(
    store: &MarketStore,
    pattern: &str,
    window: TimeWindow,
    config: &AnalysisConfig,
) -> Result<Option<SlippageReport>> {
    let tickers = store.find_tickers(pattern)?;
    if tickers.is_empty() {
        warn!("{}", MicroError::EmptyInput(format!("no tickers match '{}'", pattern)));
        return Ok(None);
    }
    info!(pattern = %pattern, count = tickers.len(), "Matched tickers");

    let horizons = &config.markout_horizons_secs;
    let results: Vec<(String, Option<Alignment>)> = tickers
        .par_iter()
        .map(|ticker| -> Result<(String, Option<Alignment>)> {
            Ok((ticker.clone(), align_market(store, ticker, window, horizons)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut used = Vec::new();
    let mut skipped = Vec::new();
    let mut parts = Vec::new();
    for (ticker, alignment) in results {
        match alignment {
            Some(a) => {
                used.push(ticker);
                parts.push(a);
            }
            None => {
                info!(ticker = %ticker, "Skipping market without trades or snapshots");
                skipped.push(ticker);
            }
        }
    }

    if parts.is_empty() {
        warn!("{}", MicroError::EmptyInput(format!("no market matching '{}' has trades and snapshots", pattern)));
        return Ok(None);
    }

    let combined = Alignment::merge(horizons, parts);
    let report = build_report(&output_name(pattern), used, skipped, &combined, config);
    info!(
        name = %report.name,
        trades = report.summary.trades,
        mean_slippage = report.summary.mean_slippage,
        "Slippage analysis complete"
    );
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exec(ts: i64, count: i64, markouts: Vec<f64>) -> TradeExecution {
        TradeExecution {
            timestamp: ts,
            ticker: "M".into(),
            price: 50.0,
            count,
            mid: 49.0,
            side: 1,
            slippage: 1.0,
            slippage_paid: count as f64,
            markouts,
        }
    }

    #[test]
    fn test_slippage_is_non_negative() {
        assert_eq!(infer_side(52.0, 50.0), 1);
        assert_eq!(slippage(52.0, 50.0, 1), 2.0);
        assert_eq!(infer_side(48.0, 50.0), -1);
        assert_eq!(slippage(48.0, 50.0, -1), 2.0);
        assert_eq!(infer_side(50.0, 50.0), 0);
        assert_eq!(slippage(50.0, 50.0, 0), 0.0);
    }

    #[test]
    fn test_markout_sign_convention() {
        assert_eq!(markout(50.0, 53.0, 1), 3.0);
        assert_eq!(markout(50.0, 53.0, -1), -3.0);
        assert_eq!(markout(50.0, 53.0, 0), 0.0);
    }

    #[test]
    fn test_volume_weighted_mean() {
        assert_eq!(volume_weighted_mean(&[1.0, 4.0], &[3, 1]), 1.75);
        assert_eq!(volume_weighted_mean(&[1.0, 4.0], &[0, 0]), 0.0);
        assert_eq!(volume_weighted_mean(&[], &[]), 0.0);
    }

    #[test]
    fn test_markout_curve() {
        let a = exec(0, 3, vec![1.0, 2.0]);
        let b = exec(1, 1, vec![3.0, -2.0]);
        let curve = markout_curve(&[&a, &b], &[1, 10]);
        assert_eq!(curve.by_trade, vec![2.0, 0.0]);
        assert_eq!(curve.by_volume, vec![1.5, 1.0]);
        assert_eq!((curve.trades, curve.volume), (2, 4));
    }

    #[test]
    fn test_hourly_buckets_skip_thin_hours() {
        let mut execs: Vec<TradeExecution> = (0..5).map(|i| exec(3_600 + i, 1, vec![1.0])).collect();
        execs.extend((0..4).map(|i| exec(7_200 + i, 1, vec![5.0])));

        let hourly = hourly_markouts(&execs, &[1], 5);
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].hour_start, 3_600);
        assert_eq!(hourly[0].curve.by_trade, vec![1.0]);
    }

    #[test]
    fn test_hourly_slippage_contiguous_in_dollars() {
        let execs = vec![exec(100, 150, vec![]), exec(3 * 3_600 + 5, 50, vec![])];
        let hourly = hourly_slippage_paid(&execs);
        assert_eq!(hourly.len(), 4);
        assert_eq!(hourly[0].slippage_paid_dollars, 1.5);
        assert_eq!(hourly[1].slippage_paid_dollars, 0.0);
        assert_eq!(hourly[3].hour_start, 10_800);
        assert_eq!(hourly[3].slippage_paid_dollars, 0.5);
    }

    #[test]
    fn test_summary() {
        let mut sell = exec(5, 1, vec![]);
        sell.side = -1;
        sell.slippage = 3.0;
        let summary = summarize(&[exec(0, 2, vec![]), sell, exec(9, 1, vec![])]);
        assert_eq!((summary.buys, summary.sells, summary.ambiguous), (2, 1, 0));
        assert!((summary.mean_slippage - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(summary.median_slippage, 1.0);
        assert_eq!(summarize(&[]).trades, 0);
    }

    #[test]
    fn test_output_name() {
        assert_eq!(output_name("KXNFLGAME-*"), "KXNFLGAME-_COMBINED");
        assert_eq!(output_name("MKT-A"), "MKT-A");
    }

    #[test]
    fn test_analyze_pattern_combines_markets() {
        let store = MarketStore::open_memory().unwrap();
        let book = crate::book::SnapshotData { yes: vec![[48, 5]], no: vec![[48, 5]] }; // mid 50
        for ticker in ["EVT-A", "EVT-B"] {
            store.insert_snapshot(ticker, 100, &book).unwrap();
            store
                .insert_trade(ticker, 105, &json!({"count": 2, "taker_side": "yes", "yes_price": 52}))
                .unwrap();
        }
        store.insert_trade("EVT-C", 105, &json!({"count": 1, "yes_price": 52})).unwrap();

        let config = AnalysisConfig::default();
        let report = analyze_pattern(&store, "EVT-*", TimeWindow::all(), &config)
            .unwrap()
            .unwrap();
        assert_eq!(report.name, "EVT-_COMBINED");
        assert_eq!(report.tickers, vec!["EVT-A", "EVT-B"]);
        assert_eq!(report.skipped_tickers, vec!["EVT-C"]);
        assert_eq!(report.summary.trades, 2);
        assert_eq!(report.summary.mean_slippage, 2.0);
        assert_eq!(report.markouts.by_trade, vec![-2.0; 5]);
        assert!((report.summary.total_slippage_paid_dollars - 0.08).abs() < 1e-12);

        assert!(analyze_pattern(&store, "NOPE-*", TimeWindow::all(), &config).unwrap().is_none());
    }

    #[test]
    fn test_window_keeps_book_in_force_and_future_mids() {
        let store = MarketStore::open_memory().unwrap();
        let at = |mid_bid: i64| crate::book::SnapshotData { yes: vec![[mid_bid, 5]], no: vec![[100 - mid_bid - 4, 5]] };
        store.insert_snapshot("EVT-A", 100, &at(48)).unwrap(); // mid 50
        store.insert_snapshot("EVT-A", 205, &at(53)).unwrap(); // mid 55
        store
            .insert_trade("EVT-A", 200, &json!({"count": 1, "taker_side": "yes", "yes_price": 52}))
            .unwrap();

        let config = AnalysisConfig {
            markout_horizons_secs: vec![1, 10],
            ..AnalysisConfig::default()
        };
        let window = TimeWindow { start_ts: Some(150), end_ts: Some(200) };
        let report = analyze_pattern(&store, "EVT-A", window, &config).unwrap().unwrap();

        assert_eq!(report.excluded_no_snapshot, 0);
        assert_eq!(report.summary.trades, 1);
        assert_eq!(report.executions[0].mid, 50.0);
        assert_eq!(report.executions[0].markouts, vec![-2.0, 3.0]);
    }
}
