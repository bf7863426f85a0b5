//! Ingestion loop: feed frames in, persisted trades and snapshots out.
//!
//! Frames are processed strictly in arrival order on one task, so each market
//! has a single writer. A frame is fully persisted before the next is read.

use crate::book::{MutationOutcome, OrderBookEngine, SnapshotSink, TimestampSource};
use crate::config::AnalysisConfig;
use crate::feed::message::{
    unsubscribe_command, DeltaMessage, FeedMessage, LifecycleMessage, SnapshotMessage,
    TradeMessage, MARKET_CHANNELS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// COLLABORATOR SEAMS
// =============================================================================

/// Destination for raw trade payloads.
pub trait TradeSink {
    fn store_trade(&self, ticker: &str, timestamp: i64, trade_data: &serde_json::Value) -> Result<()>;
}

impl<T: TradeSink + ?Sized> TradeSink for Arc<T> {
    fn store_trade(&self, ticker: &str, timestamp: i64, trade_data: &serde_json::Value) -> Result<()> {
        (**self).store_trade(ticker, timestamp, trade_data)
    }
}

/// Control channel back to the feed transport.
#[async_trait::async_trait]
pub trait FeedControl: Send {
    async fn unsubscribe(&mut self, channels: &[&str], tickers: &[String]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Transport-less control that records the commands it would send.
///
/// Used when replaying a recorded feed.
#[derive(Debug, Default)]
pub struct RecordingControl {
    next_id: u64,
    pub commands: Vec<serde_json::Value>,
    pub closed: bool,
}

#[async_trait::async_trait]
impl FeedControl for RecordingControl {
    async fn unsubscribe(&mut self, channels: &[&str], tickers: &[String]) -> Result<()> {
        self.next_id += 1;
        self.commands
            .push(unsubscribe_command(self.next_id, channels, tickers));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

// =============================================================================
// INGEST STATS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub trades_stored: u64,
    pub snapshots_initialized: u64,
    pub deltas_applied: u64,
    pub lifecycle_updates: u64,
    pub markets_determined: u64,
    pub confirmations: u64,
    pub unknown: u64,
    pub dropped_terminal: u64,
    pub malformed: u64,
    pub timestamp_fallbacks: u64,
    pub unsubscribe_failures: u64,
}

impl IngestStats {
    pub fn summary(&self) -> String {
        format!(
            "trades={}, snapshots={}, deltas={}, determined={}, confirmations={}, other={}, dropped={}, malformed={}, ts_fallbacks={}",
            self.trades_stored,
            self.snapshots_initialized,
            self.deltas_applied,
            self.markets_determined,
            self.confirmations,
            self.unknown,
            self.dropped_terminal,
            self.malformed,
            self.timestamp_fallbacks,
        )
    }
}

/// What the caller should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestControl {
    Continue,
    /// Every tracked market is terminal; the feed was closed.
    Close,
}

// =============================================================================
// INGESTOR
// =============================================================================

pub struct Ingestor<S: SnapshotSink, T: TradeSink> {
    engine: OrderBookEngine<S>,
    trades: T,
    config: AnalysisConfig,
    active: HashSet<String>,
    determined: HashSet<String>,
    /// No explicit market list: every ticker seen becomes tracked.
    track_seen: bool,
    stats: IngestStats,
}

impl<S: SnapshotSink, T: TradeSink> Ingestor<S, T> {
    /// `markets` is the subscription list. Empty means track whatever arrives.
    pub fn new(
        engine: OrderBookEngine<S>,
        trades: T,
        markets: Vec<String>,
        config: AnalysisConfig,
    ) -> Self {
        let track_seen = markets.is_empty();
        Self {
            engine,
            trades,
            config,
            active: markets.into_iter().collect(),
            determined: HashSet::new(),
            track_seen,
            stats: IngestStats::default(),
        }
    }

    /// Consume frames until the channel ends or every market is terminal.
    pub async fn run(
        &mut self,
        mut rx: mpsc::Receiver<String>,
        control: &mut dyn FeedControl,
    ) -> Result<IngestStats> {
        while let Some(raw) = rx.recv().await {
            if self.handle_raw(&raw, control).await? == IngestControl::Close {
                break;
            }
        }

        info!(
            active = self.active.len(),
            determined = self.determined.len(),
            "Feed closed"
        );
        info!(stats = %self.stats.summary(), "Final ingest stats");
        Ok(self.stats.clone())
    }

    /// Decode and handle one raw frame. Malformed frames are counted and skipped.
    pub async fn handle_raw(
        &mut self,
        raw: &str,
        control: &mut dyn FeedControl,
    ) -> Result<IngestControl> {
        match FeedMessage::decode(raw) {
            Ok(msg) => self.handle(msg, control).await,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "Skipping malformed feed message");
                Ok(IngestControl::Continue)
            }
        }
    }

    pub async fn handle(
        &mut self,
        msg: FeedMessage,
        control: &mut dyn FeedControl,
    ) -> Result<IngestControl> {
        if let FeedMessage::Lifecycle(lifecycle) = &msg {
            if self.handle_lifecycle(lifecycle, control).await {
                return Ok(IngestControl::Close);
            }
        }

        if let Some(ticker) = msg.ticker() {
            if self.determined.contains(ticker) {
                if !matches!(msg, FeedMessage::Lifecycle(_)) {
                    self.stats.dropped_terminal += 1;
                }
                return Ok(IngestControl::Continue);
            }
            if self.track_seen && !self.active.contains(ticker) {
                self.active.insert(ticker.to_string());
            }
        }

        match msg {
            FeedMessage::Trade(trade) => self.on_trade(&trade)?,
            FeedMessage::Snapshot(snapshot) => self.on_snapshot(&snapshot)?,
            FeedMessage::Delta(delta) => self.on_delta(&delta)?,
            FeedMessage::Lifecycle(_) => {}
            FeedMessage::Confirmation { kind } => {
                self.stats.confirmations += 1;
                debug!(kind = %kind, "Subscription confirmation");
            }
            FeedMessage::Unknown { kind } => {
                self.stats.unknown += 1;
                debug!(kind = %kind, "Unhandled feed message type");
            }
        }

        Ok(IngestControl::Continue)
    }

    /// Returns true when the feed was closed because nothing is left active.
    async fn handle_lifecycle(
        &mut self,
        msg: &LifecycleMessage,
        control: &mut dyn FeedControl,
    ) -> bool {
        self.stats.lifecycle_updates += 1;

        if !self.config.is_terminal(&msg.status) || self.determined.contains(&msg.ticker) {
            return false;
        }

        self.determined.insert(msg.ticker.clone());
        let was_active = self.active.remove(&msg.ticker);
        self.engine.mark_terminal(&msg.ticker);
        self.stats.markets_determined += 1;

        info!(
            ticker = %msg.ticker,
            status = %msg.status,
            remaining = self.active.len(),
            "Market determined"
        );

        let tickers = [msg.ticker.clone()];
        if let Err(e) = control.unsubscribe(&MARKET_CHANNELS, &tickers).await {
            self.stats.unsubscribe_failures += 1;
            warn!(ticker = %msg.ticker, error = %e, "Failed to unsubscribe");
        }

        // A market never tracked cannot be the last one to finish.
        if was_active && self.active.is_empty() {
            info!("All markets determined, closing feed");
            if let Err(e) = control.close().await {
                warn!(error = %e, "Failed to close feed");
            }
            return true;
        }
        false
    }

    fn on_trade(&mut self, trade: &TradeMessage) -> Result<()> {
        self.trades
            .store_trade(&trade.ticker, trade.ts, &trade.raw)
            .with_context(|| format!("Failed to store trade for {}", trade.ticker))?;
        self.stats.trades_stored += 1;
        debug!(
            ticker = %trade.ticker,
            ts = trade.ts,
            count = ?trade.raw.get("count"),
            "Trade stored"
        );
        Ok(())
    }

    fn on_snapshot(&mut self, snapshot: &SnapshotMessage) -> Result<()> {
        let outcome = self
            .engine
            .initialize_from_snapshot(&snapshot.ticker, &snapshot.yes, &snapshot.no)
            .with_context(|| format!("Failed to store snapshot for {}", snapshot.ticker))?;
        match outcome {
            MutationOutcome::Applied { .. } => self.stats.snapshots_initialized += 1,
            MutationOutcome::DroppedTerminal => self.stats.dropped_terminal += 1,
        }
        Ok(())
    }

    fn on_delta(&mut self, delta: &DeltaMessage) -> Result<()> {
        let outcome = self
            .engine
            .apply_delta(&delta.ticker, delta.side, delta.price, delta.delta, &delta.ts)
            .with_context(|| format!("Failed to store delta snapshot for {}", delta.ticker))?;

        match outcome {
            MutationOutcome::Applied { timestamp_source, .. } => {
                self.stats.deltas_applied += 1;
                if timestamp_source == TimestampSource::WallClockFallback {
                    self.stats.timestamp_fallbacks += 1;
                }
                if self.stats.deltas_applied % self.config.delta_log_every.max(1) == 0 {
                    debug!(
                        n = self.stats.deltas_applied,
                        ticker = %delta.ticker,
                        side = delta.side.as_str(),
                        price = delta.price,
                        delta = delta.delta,
                        "Delta applied"
                    );
                }
            }
            MutationOutcome::DroppedTerminal => self.stats.dropped_terminal += 1,
        }
        Ok(())
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn engine(&self) -> &OrderBookEngine<S> {
        &self.engine
    }

    pub fn active_markets(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookSide, SnapshotData};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemorySink {
        snapshots: Mutex<Vec<(String, i64, SnapshotData)>>,
        trades: Mutex<Vec<(String, i64)>>,
    }

    impl SnapshotSink for MemorySink {
        fn store_snapshot(&self, ticker: &str, timestamp: i64, data: &SnapshotData) -> Result<()> {
            self.snapshots
                .lock()
                .push((ticker.to_string(), timestamp, data.clone()));
            Ok(())
        }
    }

    impl TradeSink for MemorySink {
        fn store_trade(&self, ticker: &str, timestamp: i64, _trade_data: &serde_json::Value) -> Result<()> {
            self.trades.lock().push((ticker.to_string(), timestamp));
            Ok(())
        }
    }

    struct FailingControl;

    #[async_trait::async_trait]
    impl FeedControl for FailingControl {
        async fn unsubscribe(&mut self, _channels: &[&str], _tickers: &[String]) -> Result<()> {
            anyhow::bail!("socket gone")
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn clock() -> i64 {
        1_000
    }

    fn ingestor(markets: &[&str]) -> (Arc<MemorySink>, Ingestor<Arc<MemorySink>, Arc<MemorySink>>) {
        let sink = Arc::new(MemorySink::default());
        let engine = OrderBookEngine::new(sink.clone()).with_clock(clock);
        let ingestor = Ingestor::new(
            engine,
            sink.clone(),
            markets.iter().map(|m| m.to_string()).collect(),
            AnalysisConfig::default(),
        );
        (sink, ingestor)
    }

    fn delta(ticker: &str, price: i64, delta: i64, ts: &str) -> String {
        format!(
            r#"{{"type":"orderbook_delta","msg":{{"market_ticker":"{}","price":{},"delta":{},"side":"yes","ts":"{}"}}}}"#,
            ticker, price, delta, ts
        )
    }

    fn lifecycle(ticker: &str, status: &str) -> String {
        format!(
            r#"{{"type":"market_lifecycle_v2","msg":{{"market_ticker":"{}","status":"{}"}}}}"#,
            ticker, status
        )
    }

    #[tokio::test]
    async fn test_frames_are_applied_in_order() {
        let (sink, mut ingestor) = ingestor(&["MKT-A"]);
        let mut control = RecordingControl::default();

        let frames = [
            r#"{"type":"subscribed","msg":{"channel":"orderbook_delta"}}"#.to_string(),
            r#"{"type":"orderbook_snapshot","msg":{"market_ticker":"MKT-A","yes":[[40,5]],"no":[[55,2]]}}"#.to_string(),
            delta("MKT-A", 40, -5, "2025-11-08T14:36:53Z"),
            r#"{"type":"trade","msg":{"market_ticker":"MKT-A","ts":1762612614,"count":3,"taker_side":"no"}}"#.to_string(),
        ];
        for frame in &frames {
            assert_eq!(ingestor.handle_raw(frame, &mut control).await.unwrap(), IngestControl::Continue);
        }

        let stats = ingestor.stats();
        assert_eq!(stats.confirmations, 1);
        assert_eq!(stats.snapshots_initialized, 1);
        assert_eq!(stats.deltas_applied, 1);
        assert_eq!(stats.trades_stored, 1);

        let snapshots = sink.snapshots.lock();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].1, 1_762_612_613);
        assert!(snapshots[1].2.yes.is_empty());
        assert_eq!(ingestor.engine().book("MKT-A").unwrap().side(BookSide::No).size_at(55), 2);
    }

    #[tokio::test]
    async fn test_terminal_market_unsubscribes_and_drops() {
        let (sink, mut ingestor) = ingestor(&["MKT-A", "MKT-B"]);
        let mut control = RecordingControl::default();

        ingestor.handle_raw(&lifecycle("MKT-A", "closed"), &mut control).await.unwrap();
        ingestor
            .handle_raw(&delta("MKT-A", 40, 5, "2025-11-08T14:36:53Z"), &mut control)
            .await
            .unwrap();

        assert_eq!(ingestor.stats().markets_determined, 1);
        assert_eq!(ingestor.stats().dropped_terminal, 1);
        assert!(sink.snapshots.lock().is_empty());
        assert_eq!(control.commands.len(), 1);
        assert_eq!(control.commands[0]["params"]["market_tickers"][0], "MKT-A");
        assert!(!control.closed);

        // Repeated terminal status is not re-processed.
        ingestor.handle_raw(&lifecycle("MKT-A", "settled"), &mut control).await.unwrap();
        assert_eq!(control.commands.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_closes_when_all_markets_determined() {
        let (_sink, mut ingestor) = ingestor(&["MKT-A", "MKT-B"]);
        let mut control = RecordingControl::default();

        let first = ingestor.handle_raw(&lifecycle("MKT-A", "settled"), &mut control).await.unwrap();
        let open = ingestor.handle_raw(&lifecycle("MKT-B", "open"), &mut control).await.unwrap();
        let last = ingestor.handle_raw(&lifecycle("MKT-B", "closed"), &mut control).await.unwrap();

        assert_eq!(first, IngestControl::Continue);
        assert_eq!(open, IngestControl::Continue);
        assert_eq!(last, IngestControl::Close);
        assert!(control.closed);
        assert_eq!(ingestor.stats().lifecycle_updates, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_is_not_fatal() {
        let (_sink, mut ingestor) = ingestor(&["MKT-A", "MKT-B"]);
        let mut control = FailingControl;

        let result = ingestor.handle_raw(&lifecycle("MKT-A", "closed"), &mut control).await;
        assert_eq!(result.unwrap(), IngestControl::Continue);
        assert_eq!(ingestor.stats().unsubscribe_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_fallback_are_counted() {
        let (_sink, mut ingestor) = ingestor(&[]);
        let mut control = RecordingControl::default();

        ingestor.handle_raw("{garbage", &mut control).await.unwrap();
        ingestor
            .handle_raw(r#"{"type":"trade","msg":{"market_ticker":"MKT-A"}}"#, &mut control)
            .await
            .unwrap();
        ingestor.handle_raw(&delta("MKT-A", 40, 5, "not-a-time"), &mut control).await.unwrap();

        assert_eq!(ingestor.stats().malformed, 2);
        assert_eq!(ingestor.stats().timestamp_fallbacks, 1);
        assert_eq!(ingestor.active_markets().collect::<Vec<_>>(), vec!["MKT-A"]);
    }

    #[tokio::test]
    async fn test_unseen_market_settling_keeps_feed_open() {
        let (_sink, mut ingestor) = ingestor(&[]);
        let mut control = RecordingControl::default();

        let early = ingestor.handle_raw(&lifecycle("MKT-Z", "settled"), &mut control).await.unwrap();
        assert_eq!(early, IngestControl::Continue);
        assert!(!control.closed);

        ingestor
            .handle_raw(&delta("MKT-A", 40, 5, "2025-11-08T14:36:53Z"), &mut control)
            .await
            .unwrap();
        ingestor
            .handle_raw(&delta("MKT-Z", 40, 5, "2025-11-08T14:36:53Z"), &mut control)
            .await
            .unwrap();
        assert_eq!(ingestor.stats().dropped_terminal, 1);

        let last = ingestor.handle_raw(&lifecycle("MKT-A", "closed"), &mut control).await.unwrap();
        assert_eq!(last, IngestControl::Close);
        assert!(control.closed);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (sink, mut ingestor) = ingestor(&["MKT-A"]);
        let mut control = RecordingControl::default();
        let (tx, rx) = mpsc::channel(8);

        tx.send(delta("MKT-A", 30, 2, "2025-11-08T14:36:53Z")).await.unwrap();
        tx.send(lifecycle("MKT-A", "settled")).await.unwrap();
        tx.send(delta("MKT-A", 31, 2, "2025-11-08T14:36:54Z")).await.unwrap();
        drop(tx);

        let stats = ingestor.run(rx, &mut control).await.unwrap();
        assert_eq!(stats.deltas_applied, 1);
        assert_eq!(stats.markets_determined, 1);
        assert!(control.closed);
        assert_eq!(sink.snapshots.lock().len(), 1);
    }
}
