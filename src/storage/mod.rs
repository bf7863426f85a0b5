//! SQLite persistence for trades and order book snapshots.
//!
//! Two append-only tables, both keyed for `(ticker, timestamp)` range scans:
//! - `trades(id, timestamp, ticker, trade_data JSON, created_at)`
//! - `orderbook_snapshots(id, timestamp, ticker, snapshot_data JSON, created_at)`
//!
//! Every write is committed before the call returns.

use crate::book::{SnapshotData, SnapshotSink};
use crate::feed::TradeSink;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const MARKET_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    ticker TEXT NOT NULL,
    trade_data TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    ticker TEXT NOT NULL,
    snapshot_data TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_trades_ticker_ts ON trades(ticker, timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(timestamp);
CREATE INDEX IF NOT EXISTS idx_orderbook_ticker_ts ON orderbook_snapshots(ticker, timestamp);
CREATE INDEX IF NOT EXISTS idx_orderbook_ts ON orderbook_snapshots(timestamp);
"#;

// =============================================================================
// ROW TYPES
// =============================================================================

/// Raw `trades` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: i64,
    pub timestamp: i64,
    pub ticker: String,
    pub trade_data: String,
}

/// Raw `orderbook_snapshots` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: i64,
    pub timestamp: i64,
    pub ticker: String,
    pub snapshot_data: String,
}

/// Per-table overview used by the inspection report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub rows: i64,
    pub distinct_tickers: i64,
    pub min_ts: Option<i64>,
    pub max_ts: Option<i64>,
    /// `(ticker, rows)` ordered by row count descending.
    pub per_ticker: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSummary {
    pub trades: TableSummary,
    pub snapshots: TableSummary,
}

/// Optional inclusive time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start_ts: i64) -> Self {
        Self {
            start_ts: Some(start_ts),
            end_ts: None,
        }
    }
}

// =============================================================================
// STORAGE STATS
// =============================================================================

/// Write statistics.
#[derive(Debug, Default)]
pub struct StorageStats {
    pub trades_stored: AtomicU64,
    pub snapshots_stored: AtomicU64,
}

impl StorageStats {
    pub fn summary(&self) -> String {
        format!(
            "trades={}, snapshots={}",
            self.trades_stored.load(Ordering::Relaxed),
            self.snapshots_stored.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// MARKET STORE
// =============================================================================

/// Persistence handle for the collector and the offline analyses.
pub struct MarketStore {
    conn: Mutex<Connection>,
    stats: StorageStats,
}

impl MarketStore {
    /// Open or create storage.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open market store: {}", db_path))?;
        conn.execute_batch(MARKET_STORE_SCHEMA)?;

        info!(path = %db_path, "Market store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            stats: StorageStats::default(),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(MARKET_STORE_SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            stats: StorageStats::default(),
        })
    }

    /// Append a trade row. `trade_data` is stored verbatim as JSON.
    pub fn insert_trade(&self, ticker: &str, timestamp: i64, trade_data: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(trade_data)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (timestamp, ticker, trade_data) VALUES (?1, ?2, ?3)",
            params![timestamp, ticker, json],
        )?;
        self.stats.trades_stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append a snapshot row.
    pub fn insert_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
        let json = data.to_json()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orderbook_snapshots (timestamp, ticker, snapshot_data) VALUES (?1, ?2, ?3)",
            params![timestamp, ticker, json],
        )?;
        self.stats.snapshots_stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Trades for a ticker, ascending by timestamp then insertion order.
    pub fn load_trades(&self, ticker: &str, window: TimeWindow) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, ticker, trade_data
            FROM trades
            WHERE ticker = ?1
              AND (?2 IS NULL OR timestamp >= ?2)
              AND (?3 IS NULL OR timestamp <= ?3)
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![ticker, window.start_ts, window.end_ts], |row| {
            Self::row_to_trade(row)
        })?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(row?);
        }
        Ok(trades)
    }

    /// Snapshots for a ticker, ascending by timestamp then insertion order.
    pub fn load_snapshots(&self, ticker: &str, window: TimeWindow) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, ticker, snapshot_data
            FROM orderbook_snapshots
            WHERE ticker = ?1
              AND (?2 IS NULL OR timestamp >= ?2)
              AND (?3 IS NULL OR timestamp <= ?3)
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![ticker, window.start_ts, window.end_ts], |row| {
            Self::row_to_snapshot(row)
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    /// Snapshots needed to answer as-of queries for trades inside `window`
    /// up to `lookahead_secs` past each trade.
    ///
    /// Includes the latest snapshot before `start_ts` (the book in force when
    /// the window opens) and extends `end_ts` by `lookahead_secs`.
    pub fn snapshot_history(
        &self,
        ticker: &str,
        window: TimeWindow,
        lookahead_secs: i64,
    ) -> Result<Vec<SnapshotRow>> {
        let extended = TimeWindow {
            start_ts: window.start_ts,
            end_ts: window
                .end_ts
                .map(|end| end.saturating_add(lookahead_secs.max(0))),
        };
        let mut rows = Vec::new();
        if let Some(start) = window.start_ts {
            if let Some(governing) = self.snapshot_as_of(ticker, start.saturating_sub(1))? {
                rows.push(governing);
            }
        }
        rows.extend(self.load_snapshots(ticker, extended)?);
        Ok(rows)
    }

    /// Latest snapshot row at or before `ts`.
    pub fn snapshot_as_of(&self, ticker: &str, ts: i64) -> Result<Option<SnapshotRow>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            r#"
            SELECT id, timestamp, ticker, snapshot_data
            FROM orderbook_snapshots
            WHERE ticker = ?1 AND timestamp <= ?2
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
            params![ticker, ts],
            |row| Self::row_to_snapshot(row),
        );

        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Distinct traded tickers matching a pattern where `*` is a wildcard,
    /// sorted lexically.
    pub fn find_tickers(&self, pattern: &str) -> Result<Vec<String>> {
        let like = escape_like(pattern).replace('*', "%");
        self.distinct_trade_tickers(&like)
    }

    /// Distinct traded tickers starting with `prefix`, sorted lexically.
    pub fn tickers_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let like = format!("{}%", escape_like(prefix));
        self.distinct_trade_tickers(&like)
    }

    fn distinct_trade_tickers(&self, like: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT ticker FROM trades WHERE ticker LIKE ?1 ESCAPE '\\' ORDER BY ticker",
        )?;
        let tickers = stmt
            .query_map(params![like], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tickers)
    }

    /// Tickers traded since `since_ts` with their last trade time, newest first.
    pub fn recent_markets(&self, since_ts: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT ticker, MAX(timestamp) AS last_trade_ts
            FROM trades
            WHERE timestamp >= ?1
            GROUP BY ticker
            ORDER BY last_trade_ts DESC, ticker ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![since_ts], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
        Ok(rows)
    }

    /// Tickers with a trade or a snapshot since `since_ts`, sorted.
    pub fn active_tickers(&self, since_ts: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT ticker FROM trades WHERE timestamp >= ?1
            UNION
            SELECT ticker FROM orderbook_snapshots WHERE timestamp >= ?1
            ORDER BY ticker
            "#,
        )?;
        let rows = stmt
            .query_map(params![since_ts], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Traded contracts per UTC minute, most recent minute first.
    pub fn minute_volume(&self, ticker: &str, limit: usize) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT strftime('%Y-%m-%d %H:%M:00', datetime(timestamp, 'unixepoch')) AS minute_bucket,
                   COALESCE(SUM(json_extract(trade_data, '$.count')), 0) AS volume
            FROM trades
            WHERE ticker = ?1
            GROUP BY minute_bucket
            ORDER BY minute_bucket DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![ticker, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
        Ok(rows)
    }

    /// Row counts, tickers and time ranges of both tables.
    pub fn summary(&self) -> Result<DatabaseSummary> {
        Ok(DatabaseSummary {
            trades: self.table_summary("trades")?,
            snapshots: self.table_summary("orderbook_snapshots")?,
        })
    }

    fn table_summary(&self, table: &'static str) -> Result<TableSummary> {
        let conn = self.conn.lock();
        let (rows, distinct_tickers, min_ts, max_ts) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(DISTINCT ticker), MIN(timestamp), MAX(timestamp) FROM {}",
                table
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT ticker, COUNT(*) AS n FROM {} GROUP BY ticker ORDER BY n DESC, ticker ASC",
            table
        ))?;
        let per_ticker = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;

        Ok(TableSummary {
            rows,
            distinct_tickers,
            min_ts,
            max_ts,
            per_ticker,
        })
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    fn row_to_trade(row: &Row) -> rusqlite::Result<TradeRow> {
        Ok(TradeRow {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            ticker: row.get(2)?,
            trade_data: row.get(3)?,
        })
    }

    fn row_to_snapshot(row: &Row) -> rusqlite::Result<SnapshotRow> {
        Ok(SnapshotRow {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            ticker: row.get(2)?,
            snapshot_data: row.get(3)?,
        })
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl SnapshotSink for MarketStore {
    fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
        self.insert_snapshot(ticker, timestamp, data)
    }
}

impl TradeSink for MarketStore {
    fn store_trade(&self, ticker: &str, timestamp: i64, trade_data: &serde_json::Value) -> Result<()> {
        self.insert_trade(ticker, timestamp, trade_data)
    }
}

// =============================================================================
// TESTS
// =============================================================================
