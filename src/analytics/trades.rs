//! Trade normalisation, linked-market resolution and signed-volume flow.

use crate::analytics::align::series_len;
use crate::book::Contracts;
use crate::error::MicroError;
use crate::storage::{MarketStore, TimeWindow, TradeRow};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

// =============================================================================
// TRADE RECORD
// =============================================================================

/// Side whose resting liquidity the taker removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Yes,
    No,
    Unknown,
}

impl TakerSide {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" => Self::Yes,
            "no" => Self::No,
            _ => Self::Unknown,
        }
    }

    /// +1 for YES, -1 for NO, 0 otherwise.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Yes => 1,
            Self::No => -1,
            Self::Unknown => 0,
        }
    }
}

/// Normalised trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub ticker: String,
    pub count: Contracts,
    pub taker_side: TakerSide,
    /// YES execution price in cents; `None` if the payload carries none.
    pub price: Option<f64>,
}

impl TradeRecord {
    /// Normalise a stored payload. Never fails: a malformed payload gives
    /// count 0, side `Unknown` and no price.
    pub fn from_json(ticker: &str, timestamp: i64, raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(ticker, timestamp, &value),
            Err(_) => Self {
                timestamp,
                ticker: ticker.to_string(),
                count: 0,
                taker_side: TakerSide::Unknown,
                price: None,
            },
        }
    }

    pub fn from_value(ticker: &str, timestamp: i64, value: &Value) -> Self {
        let count = value
            .get("count")
            .and_then(|c| {
                c.as_i64()
                    .or_else(|| c.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            })
            .unwrap_or(0);
        let taker_side = value
            .get("taker_side")
            .and_then(Value::as_str)
            .map(TakerSide::parse)
            .unwrap_or(TakerSide::Unknown);

        Self {
            timestamp,
            ticker: ticker.to_string(),
            count,
            taker_side,
            price: execution_price(value),
        }
    }

    pub fn from_row(row: &TradeRow) -> Self {
        Self::from_json(&row.ticker, row.timestamp, &row.trade_data)
    }

    pub fn signed_volume(&self, invert: bool) -> i64 {
        signed_volume(self.count, self.taker_side, invert)
    }
}

/// `+count` for a YES taker, `-count` for NO, 0 for unknown; negated when
/// `invert` is set.
pub fn signed_volume(count: Contracts, side: TakerSide, invert: bool) -> i64 {
    let signed = count.saturating_mul(side.sign());
    if invert {
        signed.saturating_neg()
    } else {
        signed
    }
}

/// YES execution price in cents: `yes_price`, else `yes_price_dollars` x 100.
///
/// Dollar prices are snapped to 1/100 cent so `0.57` compares equal to `57.0`.
pub fn execution_price(value: &Value) -> Option<f64> {
    if let Some(cents) = value.get("yes_price").and_then(number_like) {
        return Some(cents);
    }
    value
        .get("yes_price_dollars")
        .and_then(number_like)
        .map(|dollars| (dollars * 10_000.0).round() / 100.0)
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

// =============================================================================
// LINKED MARKETS
// =============================================================================

/// Ticker without its final `-XXX` suffix.
pub fn event_prefix(ticker: &str) -> Option<&str> {
    ticker
        .rsplit_once('-')
        .map(|(prefix, _)| prefix)
        .filter(|prefix| !prefix.is_empty())
}

/// Outcome of a linked-market lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedMarket {
    pub ticker: String,
    /// All candidates considered, sorted.
    pub candidates: Vec<String>,
    /// Set when more than one candidate existed.
    pub ambiguity: Option<MicroError>,
}

/// Pick the linked market of `base` among same-event `candidates`.
///
/// The base ticker itself is ignored. With several candidates the first in
/// lexical order is used and the ambiguity is logged and recorded.
pub fn resolve_linked(base: &str, candidates: &[String]) -> Result<Option<LinkedMarket>, MicroError> {
    let prefix = event_prefix(base).ok_or_else(|| MicroError::UnknownTicker(base.to_string()))?;

    let mut others: Vec<String> = candidates
        .iter()
        .filter(|c| c.as_str() != base)
        .cloned()
        .collect();
    others.sort();
    others.dedup();

    let Some(first) = others.first().cloned() else {
        return Ok(None);
    };

    let ambiguity = if others.len() > 1 {
        let issue = MicroError::AmbiguousLinkedMarket {
            event_prefix: prefix.to_string(),
            candidates: others.clone(),
        };
        warn!(base = %base, chosen = %first, "{}", issue);
        Some(issue)
    } else {
        None
    };

    Ok(Some(LinkedMarket {
        ticker: first,
        candidates: others,
        ambiguity,
    }))
}

// =============================================================================
// SIGNED VOLUME FLOW
// =============================================================================

/// One trade's contribution to net flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTrade {
    pub timestamp: i64,
    pub ticker: String,
    pub signed_volume: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativePoint {
    pub timestamp: i64,
    pub ticker: String,
    pub signed_volume: i64,
    pub cumulative: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowBucket {
    pub bucket_start: i64,
    pub net_volume: i64,
}

/// Concatenate the base tape and the inverted linked tape, ordered by time.
///
/// On equal timestamps base trades come first, each tape in its own order.
pub fn combine_signed(base: &[TradeRecord], linked: &[TradeRecord]) -> Vec<SignedTrade> {
    let mut combined: Vec<SignedTrade> = base
        .iter()
        .map(|t| (t, false))
        .chain(linked.iter().map(|t| (t, true)))
        .map(|(t, invert)| SignedTrade {
            timestamp: t.timestamp,
            ticker: t.ticker.clone(),
            signed_volume: t.signed_volume(invert),
        })
        .collect();
    combined.sort_by_key(|t| t.timestamp);
    combined
}

/// Running sum of signed volume over time-ordered trades.
pub fn cumulative_signed_volume(trades: &[SignedTrade]) -> Vec<CumulativePoint> {
    let mut running = 0i64;
    trades
        .iter()
        .map(|t| {
            running = running.saturating_add(t.signed_volume);
            CumulativePoint {
                timestamp: t.timestamp,
                ticker: t.ticker.clone(),
                signed_volume: t.signed_volume,
                cumulative: running,
            }
        })
        .collect()
}

/// Net signed volume per fixed bucket, contiguous from the first trade's
/// bucket to the last, empty buckets included as 0.
pub fn net_flow(trades: &[SignedTrade], bucket_secs: i64) -> Vec<FlowBucket> {
    let bucket_secs = bucket_secs.max(1);
    let floor = |ts: i64| ts.saturating_sub(ts.rem_euclid(bucket_secs));

    let (Some(first), Some(last)) = (
        trades.iter().map(|t| t.timestamp).min(),
        trades.iter().map(|t| t.timestamp).max(),
    ) else {
        return Vec::new();
    };

    let start = floor(first);
    let Some(n) = series_len(start, floor(last), bucket_secs) else {
        return Vec::new();
    };
    let mut buckets: Vec<FlowBucket> = (0..n)
        .map(|i| FlowBucket {
            bucket_start: start + i as i64 * bucket_secs,
            net_volume: 0,
        })
        .collect();

    for t in trades {
        let idx = ((floor(t.timestamp) - start) / bucket_secs) as usize;
        buckets[idx].net_volume = buckets[idx].net_volume.saturating_add(t.signed_volume);
    }
    buckets
}

/// Cumulative volume and net-flow series for one market and its linked market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeFlowReport {
    pub base_ticker: String,
    pub linked: Option<LinkedMarket>,
    pub base_trades: usize,
    pub linked_trades: usize,
    pub final_cumulative: i64,
    pub cumulative: Vec<CumulativePoint>,
    pub bucket_secs: i64,
    pub net_flow: Vec<FlowBucket>,
}

pub fn volume_flow(
    base_ticker: &str,
    base: &[TradeRecord],
    linked: Option<(LinkedMarket, Vec<TradeRecord>)>,
    bucket_secs: i64,
) -> VolumeFlowReport {
    let (linked_market, linked_trades) = match linked {
        Some((market, trades)) => (Some(market), trades),
        None => (None, Vec::new()),
    };

    let combined = combine_signed(base, &linked_trades);
    let cumulative = cumulative_signed_volume(&combined);

    VolumeFlowReport {
        base_ticker: base_ticker.to_string(),
        linked: linked_market,
        base_trades: base.len(),
        linked_trades: linked_trades.len(),
        final_cumulative: cumulative.last().map(|p| p.cumulative).unwrap_or(0),
        net_flow: net_flow(&combined, bucket_secs),
        bucket_secs,
        cumulative,
    }
}

/// Cumulative signed volume of `base` combined with its linked market.
///
/// `linked_override` bypasses lookup. `None` when the base market has no trades.
pub fn analyze_volume_flow(
    store: &MarketStore,
    base: &str,
    linked_override: Option<&str>,
    window: TimeWindow,
    bucket_secs: i64,
) -> Result<Option<VolumeFlowReport>> {
    let base_trades: Vec<TradeRecord> = store
        .load_trades(base, window)?
        .iter()
        .map(TradeRecord::from_row)
        .collect();
    if base_trades.is_empty() {
        warn!("{}", MicroError::EmptyInput(format!("no trades for {}", base)));
        return Ok(None);
    }

    let linked = match linked_override {
        Some(ticker) => Some(LinkedMarket {
            ticker: ticker.to_string(),
            candidates: vec![ticker.to_string()],
            ambiguity: None,
        }),
        None => match event_prefix(base) {
            Some(prefix) => {
                let candidates = store.tickers_with_prefix(&format!("{}-", prefix))?;
                resolve_linked(base, &candidates).unwrap_or(None)
            }
            None => {
                warn!(ticker = %base, "Ticker has no event prefix, analysing alone");
                None
            }
        },
    };

    let linked = match linked {
        Some(market) => {
            let trades: Vec<TradeRecord> = store
                .load_trades(&market.ticker, window)?
                .iter()
                .map(TradeRecord::from_row)
                .collect();
            info!(base = %base, linked = %market.ticker, trades = trades.len(), "Linked market resolved");
            Some((market, trades))
        }
        None => {
            info!(base = %base, "No linked market found");
            None
        }
    };

    Ok(Some(volume_flow(base, &base_trades, linked, bucket_secs)))
}
