//! JSON report output and small presentation helpers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `report` as pretty JSON to `<output_dir>/<analysis>/<name>/report.json`.
pub fn write_report<T: Serialize>(
    output_dir: &Path,
    analysis: &str,
    name: &str,
    report: &T,
) -> Result<PathBuf> {
    let dir = output_dir.join(analysis).join(name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;

    let path = dir.join("report.json");
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    info!(path = %path.display(), "Report written");
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentMarket {
    pub ticker: String,
    pub last_trade_ts: i64,
}

/// Group `(ticker, last_trade_ts)` rows by UTC calendar date, e.g.
/// `Friday November 28 2025`. Input order is kept within and across groups.
pub fn recent_markets_by_date(rows: Vec<(String, i64)>) -> Vec<(String, Vec<RecentMarket>)> {
    let mut groups: Vec<(String, Vec<RecentMarket>)> = Vec::new();
    for (ticker, ts) in rows {
        let date = DateTime::<Utc>::from_timestamp(ts, 0)
            .map(|dt| dt.format("%A %B %d %Y").to_string())
            .unwrap_or_else(|| ts.to_string());
        let market = RecentMarket {
            ticker,
            last_trade_ts: ts,
        };
        match groups.last_mut() {
            Some((current, markets)) if *current == date => markets.push(market),
            _ => groups.push((date, vec![market])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(dir.path(), "slippage", "EVT-_COMBINED", &serde_json::json!({"a": 1})).unwrap();
        assert!(path.ends_with("slippage/EVT-_COMBINED/report.json"));
        let body: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(body["a"], 1);
    }

    #[test]
    fn test_recent_markets_grouping() {
        // 2025-11-28 (Friday) 18:00 and 01:00 UTC, then 2025-11-27.
        let rows = vec![
            ("A".to_string(), 1_764_352_800),
            ("B".to_string(), 1_764_291_600),
            ("C".to_string(), 1_764_280_800),
        ];
        let groups = recent_markets_by_date(rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "Friday November 28 2025");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "Thursday November 27 2025");
        assert_eq!(groups[1].1[0].ticker, "C");
    }
}
