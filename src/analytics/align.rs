//! Temporal alignment of trades against the persisted snapshot history.
//!
//! All joins are backward as-of joins: a query at time `t` sees the latest
//! snapshot with `timestamp <= t` and never one after it. Inputs are sorted
//! (stable) and de-duplicated here rather than trusted to arrive ordered.

use crate::analytics::trades::TradeRecord;
use crate::book::{best_prices_from_json, Contracts, L1Quote, SnapshotData};
use crate::error::MicroError;
use crate::storage::SnapshotRow;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on regular-grid and bucket series length (about 115 days of
/// one-second points).
pub const MAX_SERIES_POINTS: usize = 10_000_000;

/// Number of `step`-spaced points from `start` to `end` inclusive, or `None`
/// when the span overflows or exceeds [`MAX_SERIES_POINTS`].
pub fn series_len(start: i64, end: i64, step: i64) -> Option<usize> {
    let span = end.checked_sub(start).filter(|s| *s >= 0)?;
    let n = usize::try_from(span / step.max(1)).ok()?.checked_add(1)?;
    if n > MAX_SERIES_POINTS {
        warn!(start, end, step, points = n, "Series span too large, skipping");
        return None;
    }
    Some(n)
}

/// Stable-sort by key and keep the last item of every run of equal keys.
pub fn sort_dedup_last<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> i64,
{
    let mut items = items;
    items.sort_by_key(|item| key(item));

    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if let Some(last) = out.last_mut() {
            if key(last) == key(&item) {
                *last = item;
                continue;
            }
        }
        out.push(item);
    }
    out
}

// =============================================================================
// MID SERIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidPoint {
    pub timestamp: i64,
    pub mid: f64,
}

/// Mid-price history of one market, strictly ascending by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MidSeries {
    points: Vec<MidPoint>,
}

impl MidSeries {
    /// Later entries win on equal timestamps.
    pub fn from_points(points: Vec<MidPoint>) -> Self {
        Self {
            points: sort_dedup_last(points, |p| p.timestamp),
        }
    }

    /// Build from stored rows, skipping payloads that do not decode.
    /// Returns the series and the number of rows skipped.
    pub fn from_snapshot_rows(rows: &[SnapshotRow]) -> (Self, usize) {
        let mut skipped = 0usize;
        let points = rows
            .iter()
            .filter_map(|row| match best_prices_from_json(&row.snapshot_data) {
                Some(bp) => Some(MidPoint {
                    timestamp: row.timestamp,
                    mid: bp.mid(),
                }),
                None => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        (Self::from_points(points), skipped)
    }

    /// Latest point with `timestamp <= t`.
    pub fn asof(&self, t: i64) -> Option<&MidPoint> {
        let idx = self.points.partition_point(|p| p.timestamp <= t);
        idx.checked_sub(1).map(|i| &self.points[i])
    }

    /// Like [`asof`](Self::asof), naming the query time when history starts
    /// after it.
    pub fn require_asof(&self, t: i64) -> Result<&MidPoint, MicroError> {
        self.asof(t)
            .ok_or(MicroError::MissingAsOfSnapshot { query_ts: t })
    }

    pub fn mid_at(&self, t: i64) -> Option<f64> {
        self.asof(t).map(|p| p.mid)
    }

    pub fn future_mid_at(&self, t: i64, horizon_secs: i64) -> Option<f64> {
        self.mid_at(t.saturating_add(horizon_secs))
    }

    pub fn points(&self) -> &[MidPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// =============================================================================
// TRADE ALIGNMENT
// =============================================================================

/// A trade joined with the mid at trade time and at each horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRecord {
    pub timestamp: i64,
    pub ticker: String,
    pub price: f64,
    pub count: Contracts,
    pub mid: f64,
    /// Timestamp of the snapshot the mid came from.
    pub snapshot_ts: i64,
    /// Parallel to [`Alignment::horizons`].
    pub future_mids: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    pub horizons: Vec<i64>,
    pub records: Vec<AlignedRecord>,
    /// Trades before the first snapshot.
    pub excluded_no_snapshot: usize,
    /// Trades without an execution price.
    pub excluded_no_price: usize,
}

impl Alignment {
    /// Concatenate per-market alignments sharing the same horizons.
    pub fn merge(horizons: &[i64], parts: Vec<Alignment>) -> Self {
        let mut merged = Alignment {
            horizons: horizons.to_vec(),
            ..Default::default()
        };
        for part in parts {
            merged.records.extend(part.records);
            merged.excluded_no_snapshot += part.excluded_no_snapshot;
            merged.excluded_no_price += part.excluded_no_price;
        }
        merged
    }
}

/// Join each trade to `asof(t)` and `asof(t + h)` for every horizon.
pub fn align_trades(trades: &[TradeRecord], mids: &MidSeries, horizons: &[i64]) -> Alignment {
    let mut ordered: Vec<&TradeRecord> = trades.iter().collect();
    ordered.sort_by_key(|t| t.timestamp);

    let mut alignment = Alignment {
        horizons: horizons.to_vec(),
        ..Default::default()
    };

    for trade in ordered {
        let Some(price) = trade.price else {
            alignment.excluded_no_price += 1;
            continue;
        };
        let at = match mids.require_asof(trade.timestamp) {
            Ok(at) => at,
            Err(e) => {
                debug!(ticker = %trade.ticker, "{}", e);
                alignment.excluded_no_snapshot += 1;
                continue;
            }
        };

        // A snapshot exists at or before t, so one exists at or before t + h.
        let future_mids = horizons
            .iter()
            .map(|&h| mids.future_mid_at(trade.timestamp, h).unwrap_or(at.mid))
            .collect();

        alignment.records.push(AlignedRecord {
            timestamp: trade.timestamp,
            ticker: trade.ticker.clone(),
            price,
            count: trade.count,
            mid: at.mid,
            snapshot_ts: at.timestamp,
            future_mids,
        });
    }

    if alignment.excluded_no_snapshot > 0 || alignment.excluded_no_price > 0 {
        debug!(
            aligned = alignment.records.len(),
            no_snapshot = alignment.excluded_no_snapshot,
            no_price = alignment.excluded_no_price,
            "Trades excluded from alignment"
        );
    }
    alignment
}

// =============================================================================
// REGULAR GRID
// =============================================================================

/// Top-of-book observation: mid and imbalance at one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookObservation {
    pub timestamp: i64,
    pub mid: f64,
    pub imbalance: f64,
}

impl BookObservation {
    /// `None` for one-sided books, zero-size tops, or payloads that do not decode.
    pub fn from_row(row: &SnapshotRow) -> Option<Self> {
        let data = SnapshotData::from_json(&row.snapshot_data)?;
        let quote = L1Quote::from_snapshot(&data)?;
        Some(Self {
            timestamp: row.timestamp,
            mid: quote.mid(),
            imbalance: quote.imbalance()?,
        })
    }
}

/// Forward-fill observations onto a grid of `step_secs` from the first
/// observation to the last. Each grid point carries the latest observation
/// at or before it. Empty when the span is too large.
pub fn forward_fill_grid(observations: Vec<BookObservation>, step_secs: i64) -> Vec<BookObservation> {
    let step = step_secs.max(1);
    let obs = sort_dedup_last(observations, |o| o.timestamp);
    let (Some(first), Some(last)) = (obs.first(), obs.last()) else {
        return Vec::new();
    };

    let start = first.timestamp;
    let end = last.timestamp;
    let Some(n) = series_len(start, end, step) else {
        return Vec::new();
    };
    let mut grid = Vec::with_capacity(n);
    let mut cursor = 0usize;
    let mut t = start;

    while t <= end {
        while cursor + 1 < obs.len() && obs[cursor + 1].timestamp <= t {
            cursor += 1;
        }
        let o = &obs[cursor];
        grid.push(BookObservation {
            timestamp: t,
            mid: o.mid,
            imbalance: o.imbalance,
        });
        match t.checked_add(step) {
            Some(next) => t = next,
            None => break,
        }
    }
    grid
}
