//! Order book state engine.
//!
//! Owns one YES/NO level-map pair per market, applies full snapshots and
//! incremental deltas, and persists a full snapshot after every mutation.
//!
//! # Write contract
//!
//! - Snapshot-on-write: each mutation stores the whole post-update book, so
//!   "book at time T" is the latest stored snapshot with `timestamp <= T`.
//! - The snapshot is written before the call returns; callers must not advance
//!   past a message whose write failed.
//! - A failed write leaves the in-memory book untouched, so the same message
//!   can be retried.
//! - A market marked terminal accepts no further mutations.
//!
//! # Timestamps
//!
//! Snapshot messages carry no timestamp and are stamped with wall-clock time.
//! Delta timestamps are ISO-8601 (trailing `Z` = UTC) or epoch seconds. When a
//! delta timestamp cannot be parsed, wall-clock time is substituted and the
//! substitution is reported as [`TimestampSource::WallClockFallback`].

use crate::book::levels::{BookSide, Cents, Contracts, LevelChange, PriceLevelMap};
use crate::book::snapshot::SnapshotData;
use crate::error::MicroError;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// PERSISTENCE SEAM
// =============================================================================

/// Destination for snapshots produced by the engine.
pub trait SnapshotSink {
    fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()>;
}

impl<T: SnapshotSink + ?Sized> SnapshotSink for Arc<T> {
    fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
        (**self).store_snapshot(ticker, timestamp, data)
    }
}

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Timestamp as carried by a delta message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaTimestamp {
    /// ISO-8601 string, e.g. `2025-11-08T14:36:53.091704Z`.
    Iso(String),
    /// Epoch seconds.
    Epoch(i64),
    Missing,
}

/// Where a resolved timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    Feed,
    WallClock,
    WallClockFallback,
}

/// Parse an ISO-8601 timestamp to epoch seconds.
///
/// Strings with an offset (including `Z`) are honoured; strings without one
/// are read as UTC.
pub fn parse_iso_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

fn wall_clock() -> i64 {
    Utc::now().timestamp()
}

// =============================================================================
// BOOK STATE
// =============================================================================

/// YES and NO level maps of one market.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookState {
    pub yes: PriceLevelMap,
    pub no: PriceLevelMap,
}

impl BookState {
    pub fn side(&self, side: BookSide) -> &PriceLevelMap {
        match side {
            BookSide::Yes => &self.yes,
            BookSide::No => &self.no,
        }
    }

    fn side_mut(&mut self, side: BookSide) -> &mut PriceLevelMap {
        match side {
            BookSide::Yes => &mut self.yes,
            BookSide::No => &mut self.no,
        }
    }

    /// Canonical snapshot, both sides ascending by price.
    pub fn snapshot(&self) -> SnapshotData {
        SnapshotData {
            yes: self.yes.to_pairs(),
            no: self.no.to_pairs(),
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Result of one mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// State changed and the snapshot below was persisted.
    Applied {
        timestamp: i64,
        timestamp_source: TimestampSource,
        level_change: Option<LevelChange>,
        snapshot: SnapshotData,
    },
    /// Market is terminal; nothing was applied or written.
    DroppedTerminal,
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub levels_removed: u64,
    pub timestamp_fallbacks: u64,
    pub dropped_terminal: u64,
}

/// Single-writer book engine for all subscribed markets.
pub struct OrderBookEngine<S: SnapshotSink> {
    sink: S,
    books: HashMap<String, BookState>,
    terminal: HashSet<String>,
    clock: fn() -> i64,
    stats: EngineStats,
    quality_issues: Vec<MicroError>,
}

impl<S: SnapshotSink> OrderBookEngine<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            books: HashMap::new(),
            terminal: HashSet::new(),
            clock: wall_clock,
            stats: EngineStats::default(),
            quality_issues: Vec::new(),
        }
    }

    /// Replace the wall clock (tests, replay).
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Replace a market's book wholesale and persist it at wall-clock time.
    pub fn initialize_from_snapshot(
        &mut self,
        ticker: &str,
        yes: &[[i64; 2]],
        no: &[[i64; 2]],
    ) -> Result<MutationOutcome> {
        if self.terminal.contains(ticker) {
            self.stats.dropped_terminal += 1;
            return Ok(MutationOutcome::DroppedTerminal);
        }

        let state = BookState {
            yes: PriceLevelMap::from_pairs(yes.iter().map(|l| (l[0], l[1]))),
            no: PriceLevelMap::from_pairs(no.iter().map(|l| (l[0], l[1]))),
        };
        let snapshot = state.snapshot();
        let timestamp = (self.clock)();
        self.sink.store_snapshot(ticker, timestamp, &snapshot)?;
        self.books.insert(ticker.to_string(), state);
        self.stats.snapshots_applied += 1;

        info!(
            ticker = %ticker,
            yes_levels = snapshot.yes.len(),
            no_levels = snapshot.no.len(),
            "Book initialized from snapshot"
        );

        Ok(MutationOutcome::Applied {
            timestamp,
            timestamp_source: TimestampSource::WallClock,
            level_change: None,
            snapshot,
        })
    }

    /// Add `delta_size` at `price` on `side` and persist the resulting book.
    ///
    /// A market with no prior state starts from an empty book.
    pub fn apply_delta(
        &mut self,
        ticker: &str,
        side: BookSide,
        price: Cents,
        delta_size: Contracts,
        ts: &DeltaTimestamp,
    ) -> Result<MutationOutcome> {
        if self.terminal.contains(ticker) {
            self.stats.dropped_terminal += 1;
            return Ok(MutationOutcome::DroppedTerminal);
        }

        let (timestamp, timestamp_source) = self.resolve_timestamp(ticker, ts);

        // Mutate a copy; the live book only moves once the write succeeded.
        let mut book = self.books.get(ticker).cloned().unwrap_or_default();
        let change = book.side_mut(side).apply_delta(price, delta_size);
        let snapshot = book.snapshot();

        self.sink.store_snapshot(ticker, timestamp, &snapshot)?;
        self.books.insert(ticker.to_string(), book);
        self.stats.deltas_applied += 1;
        if change == LevelChange::Removed {
            self.stats.levels_removed += 1;
        }

        Ok(MutationOutcome::Applied {
            timestamp,
            timestamp_source,
            level_change: Some(change),
            snapshot,
        })
    }

    fn resolve_timestamp(&mut self, ticker: &str, ts: &DeltaTimestamp) -> (i64, TimestampSource) {
        let parsed = match ts {
            DeltaTimestamp::Epoch(secs) => Some(*secs),
            DeltaTimestamp::Iso(raw) => parse_iso_timestamp(raw),
            DeltaTimestamp::Missing => None,
        };

        match parsed {
            Some(secs) => (secs, TimestampSource::Feed),
            None => {
                let raw = match ts {
                    DeltaTimestamp::Iso(raw) => raw.clone(),
                    _ => String::new(),
                };
                warn!(
                    ticker = %ticker,
                    raw_ts = %raw,
                    "Delta timestamp unparseable, falling back to wall clock"
                );
                self.stats.timestamp_fallbacks += 1;
                self.quality_issues.push(MicroError::TimestampFallback {
                    ticker: ticker.to_string(),
                    raw,
                });
                ((self.clock)(), TimestampSource::WallClockFallback)
            }
        }
    }

    /// Stop accepting mutations for `ticker`. Returns true on first call.
    pub fn mark_terminal(&mut self, ticker: &str) -> bool {
        self.terminal.insert(ticker.to_string())
    }

    pub fn is_terminal(&self, ticker: &str) -> bool {
        self.terminal.contains(ticker)
    }

    pub fn book(&self, ticker: &str) -> Option<&BookState> {
        self.books.get(ticker)
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.books.keys().map(String::as_str)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Data-quality issues recorded so far (timestamp fallbacks).
    pub fn quality_issues(&self) -> &[MicroError] {
        &self.quality_issues
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct VecSink {
        rows: Mutex<Vec<(String, i64, SnapshotData)>>,
    }

    impl SnapshotSink for VecSink {
        fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
            self.rows.lock().push((ticker.to_string(), timestamp, data.clone()));
            Ok(())
        }
    }

    fn fixed_clock() -> i64 {
        1_700_000_000
    }

    fn engine() -> OrderBookEngine<VecSink> {
        OrderBookEngine::new(VecSink::default()).with_clock(fixed_clock)
    }

    #[test]
    fn test_parse_iso_timestamp() {
        assert_eq!(parse_iso_timestamp("2025-11-08T14:36:53.091704Z"), Some(1_762_612_613));
        assert_eq!(parse_iso_timestamp("2025-11-08T14:36:53+00:00"), Some(1_762_612_613));
        assert_eq!(parse_iso_timestamp("2025-11-08T14:36:53"), Some(1_762_612_613));
        assert_eq!(parse_iso_timestamp("yesterday"), None);
        assert_eq!(parse_iso_timestamp(""), None);
    }

    #[test]
    fn test_snapshot_replaces_prior_state() {
        let mut engine = engine();
        engine.initialize_from_snapshot("MKT-A", &[[40, 5], [45, 3]], &[[50, 2]]).unwrap();
        engine.initialize_from_snapshot("MKT-A", &[[30, 1]], &[]).unwrap();

        let book = engine.book("MKT-A").unwrap();
        assert_eq!(book.yes.to_pairs(), vec![[30, 1]]);
        assert!(book.no.is_empty());

        let rows = engine.sink().rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1, fixed_clock());
    }

    #[test]
    fn test_delta_creates_book_and_persists_sorted() {
        let mut engine = engine();
        let ts = DeltaTimestamp::Iso("2025-11-08T14:36:53.091704Z".to_string());
        engine.apply_delta("MKT-A", BookSide::Yes, 45, 3, &ts).unwrap();
        let outcome = engine.apply_delta("MKT-A", BookSide::Yes, 40, 5, &ts).unwrap();

        match outcome {
            MutationOutcome::Applied { timestamp, timestamp_source, level_change, snapshot } => {
                assert_eq!(timestamp, 1_762_612_613);
                assert_eq!(timestamp_source, TimestampSource::Feed);
                assert_eq!(level_change, Some(LevelChange::Inserted));
                assert_eq!(snapshot.yes, vec![[40, 5], [45, 3]]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_delta_removes_level_at_zero() {
        let mut engine = engine();
        engine.initialize_from_snapshot("MKT-A", &[[40, 5]], &[[50, 2]]).unwrap();
        engine
            .apply_delta("MKT-A", BookSide::No, 50, -2, &DeltaTimestamp::Epoch(10))
            .unwrap();

        let book = engine.book("MKT-A").unwrap();
        assert!(book.no.is_empty());
        assert_eq!(engine.stats().levels_removed, 1);
    }

    #[test]
    fn test_timestamp_fallback_is_counted() {
        let mut engine = engine();
        let outcome = engine
            .apply_delta("MKT-A", BookSide::Yes, 45, 1, &DeltaTimestamp::Iso("garbage".into()))
            .unwrap();

        match outcome {
            MutationOutcome::Applied { timestamp, timestamp_source, .. } => {
                assert_eq!(timestamp, fixed_clock());
                assert_eq!(timestamp_source, TimestampSource::WallClockFallback);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(engine.stats().timestamp_fallbacks, 1);
        assert_eq!(engine.quality_issues().len(), 1);
    }

    #[test]
    fn test_missing_timestamp_falls_back() {
        let mut engine = engine();
        engine
            .apply_delta("MKT-A", BookSide::Yes, 45, 1, &DeltaTimestamp::Missing)
            .unwrap();
        assert_eq!(engine.stats().timestamp_fallbacks, 1);
    }

    #[test]
    fn test_terminal_market_drops_mutations() {
        let mut engine = engine();
        engine.initialize_from_snapshot("MKT-A", &[[40, 5]], &[]).unwrap();
        assert!(engine.mark_terminal("MKT-A"));
        assert!(!engine.mark_terminal("MKT-A"));

        let outcome = engine
            .apply_delta("MKT-A", BookSide::Yes, 40, 10, &DeltaTimestamp::Epoch(5))
            .unwrap();
        assert_eq!(outcome, MutationOutcome::DroppedTerminal);
        assert_eq!(engine.book("MKT-A").unwrap().yes.size_at(40), 5);
        assert_eq!(engine.sink().rows.lock().len(), 1);
        assert_eq!(engine.stats().dropped_terminal, 1);
    }

    /// Rejects the first write, accepts the rest.
    #[derive(Default)]
    struct FlakySink {
        failed: Mutex<bool>,
        rows: Mutex<Vec<(String, i64, SnapshotData)>>,
    }

    impl SnapshotSink for FlakySink {
        fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
            let mut failed = self.failed.lock();
            if !*failed {
                *failed = true;
                anyhow::bail!("disk full");
            }
            self.rows.lock().push((ticker.to_string(), timestamp, data.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_leaves_book_unchanged() {
        let mut engine = OrderBookEngine::new(FlakySink::default()).with_clock(fixed_clock);
        let ts = DeltaTimestamp::Epoch(10);

        assert!(engine.apply_delta("MKT-A", BookSide::Yes, 40, 5, &ts).is_err());
        assert!(engine.book("MKT-A").is_none());
        assert_eq!(engine.stats().deltas_applied, 0);

        engine.apply_delta("MKT-A", BookSide::Yes, 40, 5, &ts).unwrap();
        assert_eq!(engine.book("MKT-A").unwrap().yes.size_at(40), 5);
        assert_eq!(engine.sink().rows.lock()[0].2.yes, vec![[40, 5]]);
    }

    #[test]
    fn test_failed_snapshot_write_keeps_prior_book() {
        let mut engine = OrderBookEngine::new(FlakySink::default()).with_clock(fixed_clock);
        assert!(engine.initialize_from_snapshot("MKT-A", &[[40, 5]], &[]).is_err());
        assert!(engine.book("MKT-A").is_none());

        engine.initialize_from_snapshot("MKT-A", &[[40, 5]], &[]).unwrap();
        engine
            .apply_delta("MKT-A", BookSide::Yes, 40, -5, &DeltaTimestamp::Epoch(11))
            .unwrap();
        assert!(engine.book("MKT-A").unwrap().yes.is_empty());
        assert_eq!(engine.sink().rows.lock().len(), 2);
    }

    #[test]
    fn test_markets_are_isolated() {
        let mut engine = engine();
        engine.initialize_from_snapshot("MKT-A", &[[40, 5]], &[]).unwrap();
        engine
            .apply_delta("MKT-B", BookSide::Yes, 40, 1, &DeltaTimestamp::Epoch(5))
            .unwrap();
        assert_eq!(engine.book("MKT-A").unwrap().yes.size_at(40), 5);
        assert_eq!(engine.book("MKT-B").unwrap().yes.size_at(40), 1);
    }
}
