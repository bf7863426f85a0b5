//! Point-in-time book snapshots and the YES/NO complement rule.
//!
//! A resting NO bid at price P is economically a YES ask at `100 - P`, so the
//! highest NO bid gives the lowest YES ask. All best-price and top-of-book
//! quantities here are YES-denominated.

use crate::book::levels::{Cents, Contracts, MAX_PRICE_CENTS};
use serde::{Deserialize, Serialize};

// =============================================================================
// SNAPSHOT DATA
// =============================================================================

/// Persisted snapshot payload: `{"yes": [[price, size], ...], "no": [...]}`.
///
/// Both arrays are ascending by price when produced by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    #[serde(default)]
    pub yes: Vec<[i64; 2]>,
    #[serde(default)]
    pub no: Vec<[i64; 2]>,
}

impl SnapshotData {
    /// Decode a stored `snapshot_data` column. Malformed JSON yields `None`.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Highest YES bid level.
    pub fn best_yes(&self) -> Option<(Cents, Contracts)> {
        max_level(&self.yes)
    }

    /// Highest NO bid level.
    pub fn best_no(&self) -> Option<(Cents, Contracts)> {
        max_level(&self.no)
    }

    pub fn is_empty(&self) -> bool {
        self.yes.is_empty() && self.no.is_empty()
    }
}

fn max_level(levels: &[[i64; 2]]) -> Option<(Cents, Contracts)> {
    // Arrays are sorted by construction but stored payloads may not be.
    levels
        .iter()
        .max_by_key(|l| l[0])
        .map(|l| (l[0], l[1]))
}

/// A snapshot row: one market's book at one epoch second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub ticker: String,
    pub timestamp: i64,
    pub data: SnapshotData,
}

// =============================================================================
// BEST-PRICE EXTRACTOR
// =============================================================================

/// Best YES bid / best YES ask of one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestPrices {
    /// Max YES price, 0 when the YES side is empty.
    pub best_bid: Cents,
    /// `100 - max NO price`, 100 when the NO side is empty.
    pub best_ask: Cents,
}

impl BestPrices {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) as f64 / 2.0
    }

    pub fn spread(&self) -> Cents {
        self.best_ask - self.best_bid
    }
}

/// Best prices of a decoded snapshot.
pub fn best_prices(data: &SnapshotData) -> BestPrices {
    let best_bid = data.best_yes().map(|(p, _)| p).unwrap_or(0);
    let best_ask = data
        .best_no()
        .map(|(p, _)| MAX_PRICE_CENTS - p)
        .unwrap_or(MAX_PRICE_CENTS);
    BestPrices { best_bid, best_ask }
}

/// Best prices of a stored payload; `None` if it does not decode.
pub fn best_prices_from_json(raw: &str) -> Option<BestPrices> {
    SnapshotData::from_json(raw).map(|d| best_prices(&d))
}

// =============================================================================
// TOP OF BOOK
// =============================================================================

/// Two-sided L1 quote in YES terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L1Quote {
    pub bid_price: Cents,
    pub bid_size: Contracts,
    pub ask_price: Cents,
    pub ask_size: Contracts,
}

impl L1Quote {
    /// Requires both a YES and a NO level; one-sided books have no quote.
    pub fn from_snapshot(data: &SnapshotData) -> Option<Self> {
        let (bid_price, bid_size) = data.best_yes()?;
        let (no_price, no_size) = data.best_no()?;
        Some(Self {
            bid_price,
            bid_size,
            ask_price: MAX_PRICE_CENTS - no_price,
            ask_size: no_size,
        })
    }

    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) as f64 / 2.0
    }

    pub fn imbalance(&self) -> Option<f64> {
        imbalance(self.bid_size, self.ask_size)
    }
}

/// `(bid - ask) / (bid + ask)` in `[-1, 1]`; `None` when both sizes are zero.
pub fn imbalance(bid_size: Contracts, ask_size: Contracts) -> Option<f64> {
    let total = bid_size as f64 + ask_size as f64;
    if total <= 0.0 {
        return None;
    }
    Some((bid_size as f64 - ask_size as f64) / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotData {
        SnapshotData {
            yes: vec![[40, 5], [45, 3]],
            no: vec![[50, 2], [58, 10]],
        }
    }

    #[test]
    fn test_best_prices_complement_rule() {
        let bp = best_prices(&sample());
        assert_eq!(bp.best_bid, 45);
        assert_eq!(bp.best_ask, 42);
        assert!((bp.mid() - 43.5).abs() < 1e-12);
    }

    #[test]
    fn test_best_prices_empty_sides_default() {
        let bp = best_prices(&SnapshotData::default());
        assert_eq!(bp.best_bid, 0);
        assert_eq!(bp.best_ask, 100);
        assert_eq!(bp.mid(), 50.0);
    }

    #[test]
    fn test_best_prices_unsorted_payload() {
        let raw = r#"{"yes": [[45, 3], [40, 5]], "no": [[58, 10], [50, 2]]}"#;
        let bp = best_prices_from_json(raw).unwrap();
        assert_eq!((bp.best_bid, bp.best_ask), (45, 42));
    }

    #[test]
    fn test_malformed_payload_yields_none() {
        assert!(best_prices_from_json("not json").is_none());
        assert!(best_prices_from_json(r#"{"yes": [[45]]}"#).is_none());
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let raw = r#"{"market_ticker": "X-Y", "market_id": "abc", "yes": [[30, 1]]}"#;
        let bp = best_prices_from_json(raw).unwrap();
        assert_eq!((bp.best_bid, bp.best_ask), (30, 100));
    }

    #[test]
    fn test_l1_quote_and_imbalance() {
        let q = L1Quote::from_snapshot(&sample()).unwrap();
        assert_eq!((q.bid_price, q.bid_size, q.ask_price, q.ask_size), (45, 3, 42, 10));
        let imb = q.imbalance().unwrap();
        assert!((imb - (3.0 - 10.0) / 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_l1_quote_requires_both_sides() {
        let one_sided = SnapshotData { yes: vec![[45, 3]], no: vec![] };
        assert!(L1Quote::from_snapshot(&one_sided).is_none());
    }

    #[test]
    fn test_imbalance_zero_total() {
        assert_eq!(imbalance(0, 0), None);
        assert_eq!(imbalance(5, 0), Some(1.0));
        assert_eq!(imbalance(0, 5), Some(-1.0));
    }
}
