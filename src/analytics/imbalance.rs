//! Order book imbalance predictability.
//!
//! Top-of-book (mid, imbalance) observations are forward-filled onto a regular
//! grid; forward returns are a fixed grid offset, not an as-of lookup:
//! `return(t, h) = mid(t + h) - mid(t)`. Each horizon gets a Pearson
//! correlation, its two-sided p-value and a least-squares trend line.

use crate::analytics::align::{forward_fill_grid, BookObservation};
use crate::config::AnalysisConfig;
use crate::error::MicroError;
use crate::storage::{MarketStore, SnapshotRow, TimeWindow};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::Statistics;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
}

impl TrendLine {
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonResult {
    pub horizon_secs: i64,
    pub samples: usize,
    /// `None` with fewer than two samples or a constant series.
    pub correlation: Option<f64>,
    pub p_value: Option<f64>,
    pub trend: Option<TrendLine>,
    /// `[imbalance, forward_return]` pairs.
    pub scatter: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictabilityReport {
    pub ticker: String,
    pub snapshots: usize,
    /// Snapshots with a two-sided, non-empty top of book.
    pub observations: usize,
    pub grid_step_secs: i64,
    pub grid_points: usize,
    pub horizons: Vec<HorizonResult>,
}

impl PredictabilityReport {
    /// `(horizon, correlation)` table.
    pub fn correlation_table(&self) -> Vec<(i64, Option<f64>)> {
        self.horizons
            .iter()
            .map(|h| (h.horizon_secs, h.correlation))
            .collect()
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// `(imbalance(t), mid(t + h) - mid(t))` for every grid point whose horizon
/// stays inside the grid.
pub fn forward_returns(grid: &[BookObservation], horizon_secs: i64, step_secs: i64) -> Vec<(f64, f64)> {
    let shift = (horizon_secs.max(0) / step_secs.max(1)) as usize;
    if shift >= grid.len() {
        return Vec::new();
    }
    grid.iter()
        .zip(&grid[shift..])
        .map(|(now, later)| (now.imbalance, later.mid - now.mid))
        .collect()
}

/// Sample Pearson correlation.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let sx = xs.iter().std_dev();
    let sy = ys.iter().std_dev();
    if !(sx > 0.0 && sy > 0.0) {
        return None;
    }
    let r = xs.iter().covariance(ys.iter()) / (sx * sy);
    Some(r.clamp(-1.0, 1.0))
}

/// Two-sided p-value of `r` under the null of zero correlation.
pub fn correlation_p_value(r: f64, n: usize) -> Option<f64> {
    if n <= 2 {
        return None;
    }
    if r.abs() >= 1.0 {
        return Some(0.0);
    }
    let df = (n - 2) as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

/// Least-squares line through the points; `None` if x is constant.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<TrendLine> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let var_x = xs.iter().variance();
    if !(var_x > 0.0) {
        return None;
    }
    let slope = xs.iter().covariance(ys.iter()) / var_x;
    let intercept = ys.iter().mean() - slope * xs.iter().mean();
    Some(TrendLine { slope, intercept })
}

/// Statistics for one horizon over the first `origins` grid points.
pub fn horizon_result(
    grid: &[BookObservation],
    horizon_secs: i64,
    step_secs: i64,
    origins: usize,
) -> HorizonResult {
    let mut pairs = forward_returns(grid, horizon_secs, step_secs);
    pairs.truncate(origins);
    let xs: Vec<f64> = pairs.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = pairs.iter().map(|p| p.1).collect();
    let correlation = pearson(&xs, &ys);

    HorizonResult {
        horizon_secs,
        samples: pairs.len(),
        correlation,
        p_value: correlation.and_then(|r| correlation_p_value(r, pairs.len())),
        trend: linear_fit(&xs, &ys),
        scatter: pairs.into_iter().map(|(x, y)| [x, y]).collect(),
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// `None` when no snapshot yields a usable observation.
///
/// Rows before `window.start_ts` are the book in force when the window opens
/// and are moved to the window start. Rows after `window.end_ts` only feed
/// forward returns; grid points past `end_ts` are not used as origins.
pub fn predictability(
    ticker: &str,
    rows: &[SnapshotRow],
    horizons: &[i64],
    step_secs: i64,
    window: TimeWindow,
) -> Option<PredictabilityReport> {
    let observations: Vec<BookObservation> = rows
        .iter()
        .filter_map(BookObservation::from_row)
        .map(|mut o| {
            if let Some(start) = window.start_ts {
                o.timestamp = o.timestamp.max(start);
            }
            o
        })
        .collect();
    if observations.is_empty() {
        return None;
    }
    let observed = observations.len();
    let step = step_secs.max(1);
    let grid = forward_fill_grid(observations, step);
    let origins = match window.end_ts {
        Some(end) => grid.partition_point(|g| g.timestamp <= end),
        None => grid.len(),
    };

    Some(PredictabilityReport {
        ticker: ticker.to_string(),
        snapshots: rows.len(),
        observations: observed,
        grid_step_secs: step,
        grid_points: grid.len(),
        horizons: horizons
            .iter()
            .map(|&h| horizon_result(&grid, h, step, origins))
            .collect(),
    })
}

pub fn analyze_predictability(
    store: &MarketStore,
    ticker: &str,
    window: TimeWindow,
    config: &AnalysisConfig,
) -> Result<Option<PredictabilityReport>> {
    let lookahead = config.imbalance_horizons_secs.iter().copied().max().unwrap_or(0);
    let rows = store.snapshot_history(ticker, window, lookahead)?;
    if rows.is_empty() {
        warn!("{}", MicroError::EmptyInput(format!("no snapshots for {}", ticker)));
        return Ok(None);
    }

    let report = predictability(
        ticker,
        &rows,
        &config.imbalance_horizons_secs,
        config.grid_step_secs,
        window,
    );
    match &report {
        Some(r) => {
            for h in &r.horizons {
                info!(
                    ticker = %ticker,
                    horizon_secs = h.horizon_secs,
                    samples = h.samples,
                    correlation = ?h.correlation,
                    "Imbalance correlation"
                );
            }
        }
        None => warn!(ticker = %ticker, snapshots = rows.len(), "No two-sided snapshots"),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::SnapshotData;

    fn obs(ts: i64, mid: f64, imbalance: f64) -> BookObservation {
        BookObservation { timestamp: ts, mid, imbalance }
    }

    #[test]
    fn test_pearson() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson(&xs, &[2.0, 4.0, 6.0, 8.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&xs, &[8.0, 6.0, 4.0, 2.0]).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&xs, &[1.0, 1.0, 1.0, 1.0]), None);
        assert_eq!(pearson(&[1.0], &[1.0]), None);
    }

    #[test]
    fn test_linear_fit() {
        let fit = linear_fit(&[0.0, 1.0, 2.0], &[1.0, 3.0, 5.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.at(3.0) - 7.0).abs() < 1e-12);
        assert!(linear_fit(&[1.0, 1.0], &[0.0, 5.0]).is_none());
    }

    #[test]
    fn test_p_value_bounds() {
        let strong = correlation_p_value(0.9, 100).unwrap();
        let weak = correlation_p_value(0.01, 100).unwrap();
        assert!(strong < 1e-6);
        assert!(weak > 0.5);
        assert_eq!(correlation_p_value(0.5, 2), None);
    }

    #[test]
    fn test_forward_returns_fixed_offset() {
        let grid = vec![obs(0, 50.0, 0.5), obs(1, 51.0, -0.5), obs(2, 53.0, 0.0)];
        assert_eq!(forward_returns(&grid, 1, 1), vec![(0.5, 1.0), (-0.5, 2.0)]);
        assert_eq!(forward_returns(&grid, 2, 1), vec![(0.5, 3.0)]);
        assert!(forward_returns(&grid, 3, 1).is_empty());
    }

    #[test]
    fn test_predictability_report() {
        // Positive imbalance precedes an up-move.
        let books = [
            (0, [[49, 9]], [[49, 1]]),
            (1, [[50, 1]], [[48, 9]]),
            (2, [[49, 9]], [[49, 1]]),
            (3, [[50, 1]], [[48, 9]]),
            (4, [[49, 9]], [[49, 1]]),
            (5, [[50, 1]], [[48, 9]]),
        ];
        let rows: Vec<SnapshotRow> = books
            .iter()
            .enumerate()
            .map(|(i, (ts, yes, no))| SnapshotRow {
                id: i as i64,
                timestamp: *ts,
                ticker: "M".into(),
                snapshot_data: SnapshotData { yes: yes.to_vec(), no: no.to_vec() }.to_json().unwrap(),
            })
            .collect();

        let report = predictability("M", &rows, &[1, 60], 1, TimeWindow::all()).unwrap();
        assert_eq!(report.observations, 6);
        assert_eq!(report.grid_points, 6);

        let one = &report.horizons[0];
        assert_eq!(one.samples, 5);
        assert!(one.correlation.unwrap() > 0.99);
        assert!(one.trend.unwrap().slope > 0.0);

        let long = &report.horizons[1];
        assert_eq!(long.samples, 0);
        assert_eq!(long.correlation, None);
        assert_eq!(report.correlation_table().len(), 2);
    }

    #[test]
    fn test_one_sided_history_yields_none() {
        let rows = vec![SnapshotRow {
            id: 1,
            timestamp: 0,
            ticker: "M".into(),
            snapshot_data: r#"{"yes":[[40,1]],"no":[]}"#.into(),
        }];
        assert!(predictability("M", &rows, &[1], 1, TimeWindow::all()).is_none());
    }

    #[test]
    fn test_window_starts_from_book_in_force() {
        let store = MarketStore::open_memory().unwrap();
        store
            .insert_snapshot("M", 100, &SnapshotData { yes: vec![[49, 9]], no: vec![[49, 1]] })
            .unwrap();
        store
            .insert_snapshot("M", 200, &SnapshotData { yes: vec![[50, 1]], no: vec![[48, 9]] })
            .unwrap();
        store
            .insert_snapshot("M", 230, &SnapshotData { yes: vec![[49, 9]], no: vec![[49, 1]] })
            .unwrap();

        let config = AnalysisConfig {
            imbalance_horizons_secs: vec![1, 30],
            ..AnalysisConfig::default()
        };
        let window = TimeWindow { start_ts: Some(150), end_ts: Some(200) };
        let report = analyze_predictability(&store, "M", window, &config).unwrap().unwrap();

        // Grid 150..=230; origins 150..=200.
        assert_eq!(report.grid_points, 81);
        assert_eq!(report.horizons[0].samples, 51);
        assert_eq!(report.horizons[1].samples, 51);
        assert_eq!(report.horizons[1].scatter[50], [-0.8, -1.0]);
    }
}
