//! Feed message decoding.
//!
//! Every frame is an envelope `{"type": ..., "msg": {...}}`. The envelope is
//! decoded once into [`FeedMessage`] and matched exhaustively afterwards.

use crate::book::{BookSide, Cents, Contracts, DeltaTimestamp, MAX_PRICE_CENTS};
use crate::error::MicroError;
use serde::Deserialize;
use serde_json::Value;

/// Channels a market is subscribed to, in unsubscribe order.
pub const MARKET_CHANNELS: [&str; 3] = ["trade", "orderbook_delta", "market_lifecycle_v2"];

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    msg: Value,
}

/// Executed trade. `raw` is the `msg` object, persisted verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMessage {
    pub ticker: String,
    pub ts: i64,
    pub raw: Value,
}

/// Full book for one market. Carries no timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub ticker: String,
    pub yes: Vec<[i64; 2]>,
    pub no: Vec<[i64; 2]>,
}

/// Signed size change at one price level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMessage {
    pub ticker: String,
    pub side: BookSide,
    pub price: Cents,
    pub delta: Contracts,
    pub ts: DeltaTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleMessage {
    pub ticker: String,
    pub status: String,
}

/// Decoded feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Trade(TradeMessage),
    Snapshot(SnapshotMessage),
    Delta(DeltaMessage),
    Lifecycle(LifecycleMessage),
    /// `subscribed` / `ok` acknowledgements.
    Confirmation { kind: String },
    Unknown { kind: String },
}

impl FeedMessage {
    /// Decode one raw frame.
    pub fn decode(raw: &str) -> Result<Self, MicroError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| MicroError::malformed("envelope", e.to_string()))?;
        Self::from_envelope(envelope.kind.unwrap_or_default(), envelope.msg)
    }

    /// Decode an already-parsed frame.
    pub fn from_value(value: Value) -> Result<Self, MicroError> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| MicroError::malformed("envelope", e.to_string()))?;
        Self::from_envelope(envelope.kind.unwrap_or_default(), envelope.msg)
    }

    fn from_envelope(kind: String, msg: Value) -> Result<Self, MicroError> {
        match kind.as_str() {
            "trade" => decode_trade(msg).map(Self::Trade),
            "orderbook_snapshot" => decode_snapshot(&msg).map(Self::Snapshot),
            "orderbook_delta" => decode_delta(&msg).map(Self::Delta),
            "market_lifecycle_v2" | "market_lifecycle" => {
                decode_lifecycle(&msg).map(Self::Lifecycle)
            }
            "subscribed" | "ok" => Ok(Self::Confirmation { kind }),
            _ => Ok(Self::Unknown { kind }),
        }
    }

    /// Market the frame refers to, if any.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            Self::Trade(m) => Some(&m.ticker),
            Self::Snapshot(m) => Some(&m.ticker),
            Self::Delta(m) => Some(&m.ticker),
            Self::Lifecycle(m) => Some(&m.ticker),
            Self::Confirmation { .. } | Self::Unknown { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Trade(_) => "trade",
            Self::Snapshot(_) => "orderbook_snapshot",
            Self::Delta(_) => "orderbook_delta",
            Self::Lifecycle(_) => "market_lifecycle_v2",
            Self::Confirmation { kind } | Self::Unknown { kind } => kind,
        }
    }
}

/// Wire form of an unsubscribe command.
pub fn unsubscribe_command(id: u64, channels: &[&str], tickers: &[String]) -> Value {
    let mut params = serde_json::json!({ "channels": channels });
    if !tickers.is_empty() {
        params["market_tickers"] = serde_json::json!(tickers);
    }
    serde_json::json!({
        "id": id,
        "cmd": "unsubscribe",
        "params": params,
    })
}

// =============================================================================
// FIELD DECODERS
// =============================================================================

fn ticker_of(kind: &str, msg: &Value) -> Result<String, MicroError> {
    msg.get("market_ticker")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MicroError::malformed(kind, "missing market_ticker"))
}

/// Integer field; whole-valued floats are accepted.
fn as_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

fn decode_trade(msg: Value) -> Result<TradeMessage, MicroError> {
    let ticker = ticker_of("trade", &msg)?;
    let ts = msg
        .get("ts")
        .and_then(as_int)
        .filter(|ts| *ts > 0)
        .ok_or_else(|| MicroError::malformed("trade", "missing ts"))?;
    Ok(TradeMessage { ticker, ts, raw: msg })
}

fn decode_levels(msg: &Value, key: &str) -> Result<Vec<[i64; 2]>, MicroError> {
    match msg.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(levels) => serde_json::from_value(levels.clone()).map_err(|e| {
            MicroError::malformed("orderbook_snapshot", format!("bad {} levels: {}", key, e))
        }),
    }
}

fn decode_snapshot(msg: &Value) -> Result<SnapshotMessage, MicroError> {
    Ok(SnapshotMessage {
        ticker: ticker_of("orderbook_snapshot", msg)?,
        yes: decode_levels(msg, "yes")?,
        no: decode_levels(msg, "no")?,
    })
}

fn decode_delta(msg: &Value) -> Result<DeltaMessage, MicroError> {
    const KIND: &str = "orderbook_delta";

    let ticker = ticker_of(KIND, msg)?;
    let price = msg
        .get("price")
        .and_then(as_int)
        .ok_or_else(|| MicroError::malformed(KIND, "missing price"))?;
    if !(0..=MAX_PRICE_CENTS).contains(&price) {
        return Err(MicroError::malformed(KIND, format!("price {} out of range", price)));
    }
    let delta = msg
        .get("delta")
        .and_then(as_int)
        .ok_or_else(|| MicroError::malformed(KIND, "missing delta"))?;
    let side = msg
        .get("side")
        .and_then(Value::as_str)
        .and_then(BookSide::parse)
        .ok_or_else(|| MicroError::malformed(KIND, "missing or unknown side"))?;

    let ts = match msg.get("ts") {
        Some(Value::String(s)) => DeltaTimestamp::Iso(s.clone()),
        Some(v) => as_int(v).map(DeltaTimestamp::Epoch).unwrap_or(DeltaTimestamp::Missing),
        None => DeltaTimestamp::Missing,
    };

    Ok(DeltaMessage { ticker, side, price, delta, ts })
}

fn decode_lifecycle(msg: &Value) -> Result<LifecycleMessage, MicroError> {
    let ticker = ticker_of("market_lifecycle", msg)?;
    let status = msg
        .get("status")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MicroError::malformed("market_lifecycle", "missing status"))?;
    Ok(LifecycleMessage {
        ticker,
        status: status.to_string(),
    })
}
